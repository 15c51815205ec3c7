use chrono::Utc;
use serde_json::json;
use tracing::Level;

use mctl_observability::{emit_event, ObservabilityEvent, ProcessKind};
use mctl_types::{Approval, ApprovalStatus, HandoffKind, RunStatus, Task, TaskStatus};

use crate::orchestrator::DispatchPlan;
use crate::{DispatchReceipt, MissionControl, MissionError, MissionResult, SideEffect};

impl MissionControl {
    /// Resolves a pending approval: task completed, open runs closed, deliverable archived.
    pub async fn approve(
        &self,
        approval_id: &str,
        approver: &str,
        requester_tenant: Option<&str>,
    ) -> MissionResult<Approval> {
        self.visible_approval(approval_id, requester_tenant).await?;
        let approver = match approver.trim() {
            "" => "anonymous".to_string(),
            name => name.to_string(),
        };
        let now = Utc::now();
        let id = approval_id.to_string();
        let decided_by = approver.clone();
        let (approval, task, body) = self
            .storage
            .transact(move |state| {
                let approval = state
                    .approvals
                    .get(&id)
                    .ok_or_else(|| MissionError::not_found("approval", &id))?;
                if approval.status != ApprovalStatus::Pending {
                    return Err(MissionError::conflict(format!(
                        "approval `{id}` was already resolved"
                    )));
                }
                let task_id = approval.task_id.clone();
                state.transition(&task_id, TaskStatus::Completed, now)?;
                state.close_open_runs(&task_id, RunStatus::Completed, now);

                let approval = state
                    .approvals
                    .get_mut(&id)
                    .ok_or_else(|| MissionError::not_found("approval", &id))?;
                approval.status = ApprovalStatus::Approved;
                approval.decided_by = Some(decided_by);
                approval.decided_at = Some(now);
                let approval = approval.clone();

                let body = state
                    .runs
                    .values()
                    .filter(|run| run.task_id == task_id)
                    .filter(|run| run.output_summary.is_some())
                    .max_by_key(|run| run.started_at)
                    .and_then(|run| run.output_summary.clone())
                    .unwrap_or_default();
                Ok((approval, state.task(&task_id)?.clone(), body))
            })
            .await?;

        match self
            .artifacts
            .write_deliverable(&task, &body, Some(&approver), now)
            .await
        {
            Ok(path) => {
                self.event_bus.emit(
                    "artifact.written",
                    json!({"taskID": task.id, "path": path.display().to_string()}),
                );
            }
            Err(err) => {
                let detail = format!("{err:#}");
                emit_event(
                    Level::ERROR,
                    ProcessKind::Engine,
                    ObservabilityEvent::new("approvals", "artifact.write_failed")
                        .task(&task.id)
                        .error_code("ARTIFACT_WRITE_FAILED")
                        .detail(&detail),
                );
            }
        }

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("approvals", "approval.approved")
                .task(&task.id)
                .status("completed")
                .detail(&approver),
        );
        self.event_bus.emit(
            "approval.resolved",
            json!({
                "approvalID": approval.id,
                "taskID": task.id,
                "status": approval.status,
                "decidedBy": approver,
            }),
        );
        self.side_effects.enqueue(SideEffect::FanIn {
            task_id: task.id.clone(),
        });
        Ok(approval)
    }

    /// Rejects with a mandatory note and re-dispatches to the owning role with the note
    /// injected ahead of the prompt.
    pub async fn reject(
        &self,
        approval_id: &str,
        note: &str,
        reviewer: &str,
        requester_tenant: Option<&str>,
    ) -> MissionResult<DispatchReceipt> {
        let note = note.trim().to_string();
        if note.is_empty() {
            return Err(MissionError::invalid("a rejection note is required"));
        }
        let reviewer = match reviewer.trim() {
            "" => "anonymous".to_string(),
            name => name.to_string(),
        };
        let (_, task) = self.visible_approval(approval_id, requester_tenant).await?;
        let role_id = match task.owner_role_id.trim() {
            "" => self.roles.route(&task.title, &task.objective).await.id,
            owner => owner.to_string(),
        };

        let now = Utc::now();
        let id = approval_id.to_string();
        let task_id = task.id.clone();
        let stored_note = note.clone();
        let decided_by = reviewer.clone();
        let plan = DispatchPlan {
            role_id,
            requester_tenant: task.tenant_id.clone(),
            sub_prompt: None,
            handoff_kind: HandoffKind::Rework,
            handoff_from: Some(format!("hitl:{reviewer}")),
            reason: note.clone(),
        };
        let receipt = self
            .dispatch_with(&task.id, plan, move |state| {
                let approval = state
                    .approvals
                    .get_mut(&id)
                    .ok_or_else(|| MissionError::not_found("approval", &id))?;
                if approval.status != ApprovalStatus::Pending {
                    return Err(MissionError::conflict(format!(
                        "approval `{id}` was already resolved"
                    )));
                }
                approval.status = ApprovalStatus::Rejected;
                approval.decision_note = Some(stored_note.clone());
                approval.decided_by = Some(decided_by);
                approval.decided_at = Some(now);
                state.close_open_runs(&task_id, RunStatus::Completed, now);
                state.task_mut(&task_id)?.revision_note = Some(stored_note);
                Ok(())
            })
            .await?;

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("approvals", "approval.rejected")
                .task(&task.id)
                .run(&receipt.run_id)
                .status("in_execution")
                .detail(&reviewer),
        );
        self.event_bus.emit(
            "approval.resolved",
            json!({
                "approvalID": approval_id,
                "taskID": task.id,
                "status": ApprovalStatus::Rejected,
                "decidedBy": reviewer,
                "note": note,
            }),
        );
        Ok(receipt)
    }

    /// An approval whose task belongs to another tenant reads as missing.
    async fn visible_approval(
        &self,
        approval_id: &str,
        requester_tenant: Option<&str>,
    ) -> MissionResult<(Approval, Task)> {
        let approval = self
            .storage
            .get_approval(approval_id)
            .await
            .ok_or_else(|| MissionError::not_found("approval", approval_id))?;
        let task = self
            .visible_task(&approval.task_id, requester_tenant)
            .await
            .map_err(|err| match err {
                MissionError::NotFound { .. } => MissionError::not_found("approval", approval_id),
                other => other,
            })?;
        Ok((approval, task))
    }
}
