//! Severity-driven replanning with a per-parent circuit breaker.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::Level;

use mctl_observability::{emit_event, ObservabilityEvent, ProcessKind};
use mctl_types::{
    Handoff, HandoffKind, Insight, NewTask, OriginChannel, Priority, Severity, Task, TaskKind,
    TaskOrigin, TaskStatus,
};

use crate::{MissionControl, MissionError, MissionResult, Notification, SideEffect, StoreState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplanOutcome {
    /// Severity below S2; nothing to do.
    Ignored,
    /// The interrupt budget was already spent and the parent is now blocked.
    CircuitBroken { parent_id: String, interrupt_count: u32 },
    Applied {
        parent_id: String,
        interrupt_count: u32,
        mitigation_task_id: String,
        affected: Vec<String>,
    },
}

/// Applies one insight to the task graph. Runs inside a single store transaction, so the
/// counter increment, the status changes and the order shift land together or not at all.
pub fn plan_replan(
    state: &mut StoreState,
    insight: &Insight,
    now: DateTime<Utc>,
) -> MissionResult<ReplanOutcome> {
    if !insight.severity.triggers_replan() {
        return Ok(ReplanOutcome::Ignored);
    }
    let parent_id = insight.parent_task_id.clone();
    let parent = state.task(&parent_id)?.clone();

    if parent.interrupt_count >= parent.max_interrupts {
        state.try_transition(&parent_id, TaskStatus::Blocked, now)?;
        state.handoffs.push(Handoff::new(
            &parent_id,
            "replan",
            "hitl",
            HandoffKind::Block,
            format!(
                "circuit breaker tripped at {}/{} interrupts",
                parent.interrupt_count, parent.max_interrupts
            ),
            now,
        ));
        return Ok(ReplanOutcome::CircuitBroken {
            parent_id,
            interrupt_count: parent.interrupt_count,
        });
    }

    let interrupt_count = parent.interrupt_count.saturating_add(1);
    {
        let task = state.task_mut(&parent_id)?;
        task.interrupt_count = interrupt_count;
        task.updated_at = now;
    }

    let descendants = state.descendant_ids(&parent_id);
    let affected = if insight.affected_tasks.is_empty() {
        descendants
    } else {
        insight
            .affected_tasks
            .iter()
            .filter(|id| descendants.contains(id))
            .cloned()
            .collect::<Vec<_>>()
    };
    let target = match insight.severity {
        Severity::S3 => TaskStatus::Blocked,
        _ => TaskStatus::NeedsUpdate,
    };
    for id in &affected {
        if !state.try_transition(id, target, now)? {
            tracing::debug!(task_id = %id, target = %target, "affected task left in place");
        }
    }

    let siblings = state
        .children_of(&parent_id)
        .into_iter()
        .map(|task| (task.id.clone(), task.execution_order))
        .collect::<Vec<_>>();
    let front = siblings.iter().map(|(_, order)| *order).min().unwrap_or(0);
    for (id, _) in &siblings {
        state.task_mut(id)?.execution_order += 1;
    }

    let mitigation = mitigation_task(&parent, insight, front, now);
    let mitigation_task_id = mitigation.id.clone();
    state.handoffs.push(Handoff::new(
        &mitigation_task_id,
        insight.source_role.as_deref().unwrap_or("replan"),
        &mitigation.owner_role_id,
        HandoffKind::UrgentReplan,
        insight.claim.clone(),
        now,
    ));
    state.tasks.insert(mitigation_task_id.clone(), mitigation);

    Ok(ReplanOutcome::Applied {
        parent_id,
        interrupt_count,
        mitigation_task_id,
        affected,
    })
}

fn mitigation_task(parent: &Task, insight: &Insight, order: i64, now: DateTime<Utc>) -> Task {
    let mut objective = format!(
        "Urgent replan for \"{}\" ({:?}): {}",
        parent.title, insight.severity, insight.claim
    );
    if !insight.evidence_refs.is_empty() {
        objective.push_str("\nEvidence: ");
        objective.push_str(&insight.evidence_refs.join(", "));
    }
    if !insight.suggested_next_tasks.is_empty() {
        objective.push_str("\nSuggested next steps:");
        for step in &insight.suggested_next_tasks {
            objective.push_str("\n- ");
            objective.push_str(step);
        }
    }

    let mut input = NewTask::new(
        format!("Mitigate: {}", first_line(&insight.claim)),
        objective,
        parent.tenant_id.clone(),
    );
    input.parent_id = Some(parent.id.clone());
    input.owner_role_id = parent.owner_role_id.clone();
    input.priority = Priority::Urgent;
    input.kind = TaskKind::Mitigation;
    input.execution_order = order;
    input.max_interrupts = parent.max_interrupts;
    input.origin = TaskOrigin::channel(OriginChannel::Replan);
    input.context_payload = Some(json!({
        "insight_id": insight.id,
        "severity": insight.severity,
        "affected_tasks": insight.affected_tasks,
    }));
    Task::new(input, now)
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() > 80 {
        format!("{}...", line.chars().take(80).collect::<String>())
    } else {
        line.to_string()
    }
}

impl MissionControl {
    pub async fn apply_replan(&self, insight_id: &str) -> MissionResult<ReplanOutcome> {
        let insight = self
            .storage
            .get_insight(insight_id)
            .await
            .ok_or_else(|| MissionError::not_found("insight", insight_id))?;
        let now = Utc::now();
        let planned = insight.clone();
        let outcome = self
            .storage
            .transact(move |state| plan_replan(state, &planned, now))
            .await?;

        match &outcome {
            ReplanOutcome::Ignored => {}
            ReplanOutcome::CircuitBroken {
                parent_id,
                interrupt_count,
            } => {
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent::new("replan", "circuit.tripped")
                        .task(parent_id)
                        .status("blocked")
                        .error_code("CIRCUIT_BROKEN")
                        .detail(&insight.claim),
                );
                self.event_bus.emit(
                    "circuit.tripped",
                    json!({
                        "taskID": parent_id,
                        "interruptCount": interrupt_count,
                        "insightID": insight.id,
                    }),
                );
                self.notify(Notification::urgent(
                    "Circuit breaker tripped",
                    format!(
                        "Task {parent_id} hit its interrupt budget ({interrupt_count}) and is blocked.\nLatest insight ({:?}): {}",
                        insight.severity, insight.claim
                    ),
                    parent_id,
                ));
            }
            ReplanOutcome::Applied {
                parent_id,
                interrupt_count,
                mitigation_task_id,
                affected,
            } => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent::new("replan", "replan.applied")
                        .task(parent_id)
                        .status(&format!("{interrupt_count}"))
                        .detail(mitigation_task_id),
                );
                self.event_bus.emit(
                    "replan.applied",
                    json!({
                        "taskID": parent_id,
                        "insightID": insight.id,
                        "interruptCount": interrupt_count,
                        "mitigationTaskID": mitigation_task_id,
                        "affected": affected,
                    }),
                );
                if self.config.get().await.workflow.auto_orchestrate_mitigations {
                    self.side_effects.enqueue(SideEffect::Orchestrate {
                        task_id: mitigation_task_id.clone(),
                    });
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mctl_types::{NewInsight, Severity};

    fn task(id: &str, parent: Option<&str>, order: i64) -> Task {
        let mut input = NewTask::new(format!("task {id}"), "objective", "acme");
        input.parent_id = parent.map(str::to_string);
        input.execution_order = order;
        input.owner_role_id = "researcher".into();
        let mut task = Task::new(input, Utc::now());
        task.id = id.to_string();
        task
    }

    fn graph() -> StoreState {
        let mut state = StoreState::default();
        for task in [
            task("parent", None, 0),
            task("child-1", Some("parent"), 0),
            task("child-2", Some("parent"), 1),
            task("grandchild", Some("child-2"), 0),
        ] {
            state.tasks.insert(task.id.clone(), task);
        }
        state
    }

    fn insight(severity: Severity, affected: &[&str]) -> Insight {
        Insight::new(
            NewInsight {
                parent_task_id: "parent".into(),
                status: "open".into(),
                claim: "upstream data is stale".into(),
                severity,
                evidence_refs: vec!["doc://feed".into()],
                affected_tasks: affected.iter().map(|s| s.to_string()).collect(),
                suggested_next_tasks: vec!["refresh feed".into()],
                source_role: Some("researcher".into()),
            },
            Utc::now(),
        )
    }

    #[test]
    fn s3_blocks_affected_and_fronts_mitigation() {
        let mut state = graph();
        let outcome = plan_replan(&mut state, &insight(Severity::S3, &["child-1"]), Utc::now())
            .expect("replan");
        let ReplanOutcome::Applied {
            interrupt_count,
            mitigation_task_id,
            affected,
            ..
        } = outcome
        else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(interrupt_count, 1);
        assert_eq!(affected, vec!["child-1".to_string()]);
        assert_eq!(state.tasks["parent"].interrupt_count, 1);
        assert_eq!(state.tasks["child-1"].status, TaskStatus::Blocked);
        assert_eq!(state.tasks["child-2"].status, TaskStatus::Intake);

        let mitigation = &state.tasks[&mitigation_task_id];
        assert_eq!(mitigation.kind, TaskKind::Mitigation);
        assert_eq!(mitigation.priority, Priority::Urgent);
        assert_eq!(mitigation.tenant_id, "acme");
        let others = state
            .children_of("parent")
            .into_iter()
            .filter(|t| t.id != mitigation_task_id)
            .map(|t| t.execution_order)
            .collect::<Vec<_>>();
        assert_eq!(others, vec![1, 2]);
        assert!(others.iter().all(|order| mitigation.execution_order < *order));
        assert_eq!(state.children_of("parent")[0].id, mitigation_task_id);
        assert!(state
            .handoffs
            .iter()
            .any(|h| h.task_id == mitigation_task_id && h.kind == HandoffKind::UrgentReplan));
    }

    #[test]
    fn s2_without_explicit_list_touches_all_descendants() {
        let mut state = graph();
        plan_replan(&mut state, &insight(Severity::S2, &[]), Utc::now()).expect("replan");
        for id in ["child-1", "child-2", "grandchild"] {
            assert_eq!(state.tasks[id].status, TaskStatus::NeedsUpdate, "{id}");
        }
    }

    #[test]
    fn ids_outside_the_subtree_are_ignored() {
        let mut state = graph();
        state.tasks.insert("stranger".into(), task("stranger", None, 0));
        plan_replan(
            &mut state,
            &insight(Severity::S3, &["stranger", "grandchild"]),
            Utc::now(),
        )
        .expect("replan");
        assert_eq!(state.tasks["stranger"].status, TaskStatus::Intake);
        assert_eq!(state.tasks["grandchild"].status, TaskStatus::Blocked);
    }

    #[test]
    fn low_severity_is_ignored() {
        let mut state = graph();
        let outcome = plan_replan(&mut state, &insight(Severity::S1, &[]), Utc::now()).expect("ok");
        assert_eq!(outcome, ReplanOutcome::Ignored);
        assert_eq!(state.tasks["parent"].interrupt_count, 0);
        assert_eq!(state.tasks.len(), 4);
    }

    #[test]
    fn exhausted_budget_blocks_parent_without_new_tasks() {
        let mut state = graph();
        state.tasks.get_mut("parent").expect("parent").interrupt_count = 3;
        let outcome = plan_replan(&mut state, &insight(Severity::S2, &[]), Utc::now()).expect("ok");
        assert!(matches!(outcome, ReplanOutcome::CircuitBroken { interrupt_count: 3, .. }));
        assert_eq!(state.tasks["parent"].status, TaskStatus::Blocked);
        assert_eq!(state.tasks["parent"].interrupt_count, 3);
        assert_eq!(state.tasks.len(), 4);
        assert_eq!(state.tasks["child-1"].status, TaskStatus::Intake);
    }

    #[test]
    fn long_claims_are_shortened_in_titles() {
        assert_eq!(first_line("short\nsecond"), "short");
        let long = "x".repeat(100);
        assert_eq!(first_line(&long).chars().count(), 83);
    }
}
