//! Fan-in: once every child of a parent is completed, a single synthesis task gathers them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::Level;

use mctl_observability::{emit_event, ObservabilityEvent, ProcessKind};
use mctl_types::{
    Handoff, HandoffKind, NewTask, OriginChannel, Task, TaskKind, TaskOrigin, TaskStatus, Verdict,
};

use crate::{MissionControl, MissionResult, SideEffect, StoreState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FanInOutcome {
    NoParent,
    Pending { completed: usize, total: usize },
    /// All children are done but the verifier has not approved the parent yet.
    AwaitingVerdict,
    AlreadySynthesized { synthesis_task_id: String },
    Created { synthesis_task_id: String },
}

/// Decides and, when due, inserts the synthesis task. Must run inside one store transaction:
/// the existence check and the insert are what keep racing completions from double-creating.
pub fn plan_fan_in(
    state: &mut StoreState,
    parent_id: &str,
    verifier_required: bool,
    now: DateTime<Utc>,
) -> MissionResult<FanInOutcome> {
    let parent = state.task(parent_id)?.clone();
    let children = state.children_of(parent_id);
    if let Some(existing) = children.iter().find(|t| t.kind == TaskKind::Synthesis) {
        return Ok(FanInOutcome::AlreadySynthesized {
            synthesis_task_id: existing.id.clone(),
        });
    }
    let total = children.len();
    let completed = children
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    if total == 0 || completed < total {
        return Ok(FanInOutcome::Pending { completed, total });
    }
    if verifier_required {
        let approved = state
            .latest_review_for(parent_id)
            .is_some_and(|review| review.verdict == Verdict::Approve);
        if !approved {
            return Ok(FanInOutcome::AwaitingVerdict);
        }
    }

    let relay = children.iter().map(|child| relay_entry(child)).collect::<Vec<_>>();
    let next_order = children
        .iter()
        .map(|t| t.execution_order)
        .max()
        .unwrap_or(0)
        + 1;

    let mut input = NewTask::new(
        format!("Final synthesis: {}", parent.title),
        format!(
            "Merge the results of {total} completed subtasks into one final deliverable for: {}",
            parent.objective
        ),
        parent.tenant_id.clone(),
    );
    input.parent_id = Some(parent.id.clone());
    input.owner_role_id = parent.owner_role_id.clone();
    input.priority = parent.priority;
    input.kind = TaskKind::Synthesis;
    input.execution_order = next_order;
    input.max_interrupts = parent.max_interrupts;
    input.origin = TaskOrigin::channel(OriginChannel::Synthesis);
    input.context_payload = Some(json!({
        "parent_task_id": parent.id,
        "children": relay,
    }));
    let synthesis = Task::new(input, now);
    let synthesis_task_id = synthesis.id.clone();
    state.handoffs.push(Handoff::new(
        &synthesis_task_id,
        "fan_in",
        &synthesis.owner_role_id,
        HandoffKind::Synthesis,
        format!("{total} children completed"),
        now,
    ));
    state.tasks.insert(synthesis_task_id.clone(), synthesis);
    Ok(FanInOutcome::Created { synthesis_task_id })
}

fn relay_entry(child: &Task) -> Value {
    json!({
        "id": child.id,
        "title": child.title,
        "objective": child.objective,
        "status": child.status,
        "owner_role_id": child.owner_role_id,
        "execution_order": child.execution_order,
        "updated_at": child.updated_at,
        "context_payload": child.context_payload,
    })
}

impl MissionControl {
    /// Runs after a task completes and checks its parent.
    pub async fn evaluate_fan_in(&self, task_id: &str) -> MissionResult<FanInOutcome> {
        let parent_id = self
            .storage
            .read(|state| state.task(task_id).map(|t| t.parent_id.clone()))
            .await?;
        match parent_id {
            Some(parent_id) => self.evaluate_parent(&parent_id).await,
            None => Ok(FanInOutcome::NoParent),
        }
    }

    pub async fn evaluate_parent(&self, parent_id: &str) -> MissionResult<FanInOutcome> {
        let cfg = self.config.get().await;
        let verifier_required = match cfg.workflow.verifier_role.as_deref() {
            Some(role_id) => self.roles.exists(role_id).await,
            None => false,
        };
        let now = Utc::now();
        let id = parent_id.to_string();
        let outcome = self
            .storage
            .transact(move |state| plan_fan_in(state, &id, verifier_required, now))
            .await?;

        match &outcome {
            FanInOutcome::Created { synthesis_task_id } => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent::new("fan_in", "synthesis.created")
                        .task(parent_id)
                        .detail(synthesis_task_id),
                );
                self.event_bus.emit(
                    "synthesis.created",
                    json!({"parentTaskID": parent_id, "taskID": synthesis_task_id}),
                );
                self.side_effects.enqueue(SideEffect::Orchestrate {
                    task_id: synthesis_task_id.clone(),
                });
            }
            FanInOutcome::AwaitingVerdict => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent::new("fan_in", "synthesis.awaiting_verdict")
                        .task(parent_id)
                        .status("awaiting_verdict"),
                );
            }
            other => {
                tracing::debug!(parent_id, outcome = ?other, "fan-in not due");
            }
        }
        Ok(outcome)
    }
}
