use chrono::Utc;
use serde_json::json;
use tracing::Level;

use mctl_observability::{emit_event, ObservabilityEvent, ProcessKind};
use mctl_types::{Handoff, HandoffKind, NewReview, Review, TaskStatus, Verdict};

use crate::{MissionControl, MissionResult, Notification, SideEffect};

impl MissionControl {
    /// Stores a verifier verdict and applies it to the task graph.
    pub async fn submit_review(&self, input: NewReview) -> MissionResult<Review> {
        let mut input = input;
        input.reviewer = input.reviewer.trim().to_string();
        if input.reviewer.is_empty() {
            input.reviewer = self
                .config
                .get()
                .await
                .workflow
                .verifier_role
                .unwrap_or_else(|| "verifier".to_string());
        }
        let review = Review::new(input, Utc::now());
        let stored = review.clone();
        let now = review.created_at;
        let touched = self
            .storage
            .transact(move |state| {
                state.task(&stored.task_id)?;
                let mut touched = Vec::new();
                match stored.verdict {
                    Verdict::Approve => {}
                    Verdict::NeedsRevision => {
                        let targets = if stored.affected_tasks.is_empty() {
                            vec![stored.task_id.clone()]
                        } else {
                            // Only the reviewed task and its own subtree.
                            let descendants = state.descendant_ids(&stored.task_id);
                            stored
                                .affected_tasks
                                .iter()
                                .filter(|id| {
                                    **id == stored.task_id || descendants.contains(*id)
                                })
                                .cloned()
                                .collect()
                        };
                        for id in targets {
                            if state.try_transition(&id, TaskStatus::NeedsUpdate, now)? {
                                touched.push(id);
                            }
                        }
                    }
                    Verdict::Block => {
                        if state.try_transition(&stored.task_id, TaskStatus::Blocked, now)? {
                            touched.push(stored.task_id.clone());
                        }
                        state.handoffs.push(Handoff::new(
                            &stored.task_id,
                            &stored.reviewer,
                            "hitl",
                            HandoffKind::Block,
                            stored.summary.clone(),
                            now,
                        ));
                    }
                }
                state.reviews.push(stored);
                Ok(touched)
            })
            .await?;

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("verdicts", "review.recorded")
                .task(&review.task_id)
                .role(&review.reviewer)
                .status(review.verdict.as_str()),
        );
        self.event_bus.emit(
            "review.recorded",
            json!({
                "reviewID": review.id,
                "taskID": review.task_id,
                "verdict": review.verdict,
                "updated": touched,
            }),
        );

        match review.verdict {
            Verdict::Approve => self.side_effects.enqueue(SideEffect::FanInParent {
                parent_id: review.task_id.clone(),
            }),
            Verdict::Block => self.notify(Notification::urgent(
                "Verifier blocked a task",
                if review.summary.trim().is_empty() {
                    format!("{} blocked task {}", review.reviewer, review.task_id)
                } else {
                    review.summary.clone()
                },
                &review.task_id,
            )),
            Verdict::NeedsRevision if touched.is_empty() => {
                tracing::warn!(review_id = %review.id, "revision verdict changed no task status");
            }
            Verdict::NeedsRevision => {}
        }
        Ok(review)
    }
}
