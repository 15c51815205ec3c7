use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::Level;

use mctl_observability::{emit_event, ObservabilityEvent, ProcessKind};
use mctl_types::{Handoff, HandoffKind, Run, RunStatus, Task, TaskStatus};

use crate::{MissionControl, MissionError, MissionResult, RunRequest, StoreState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReceipt {
    pub status: TaskStatus,
    pub owner_role_id: String,
    pub run_id: String,
}

/// How a dispatch should be recorded in the handoff trail.
pub(crate) struct DispatchPlan {
    pub role_id: String,
    pub requester_tenant: String,
    pub sub_prompt: Option<String>,
    pub handoff_kind: HandoffKind,
    /// Defaults to the previous owner, or `orchestrator` for a fresh task.
    pub handoff_from: Option<String>,
    pub reason: String,
}

impl MissionControl {
    /// Resolves a role and starts a run. A task that already has a running run returns that
    /// run instead of starting another.
    pub async fn orchestrate(
        &self,
        task_id: &str,
        requester_tenant: Option<&str>,
        explicit_role: Option<&str>,
    ) -> MissionResult<DispatchReceipt> {
        let task = self.visible_task(task_id, requester_tenant).await?;
        let existing = self
            .storage
            .read(|state| state.running_run_for(task_id).cloned())
            .await;
        if let Some(run) = existing {
            return Ok(DispatchReceipt {
                status: task.status,
                owner_role_id: run.role_id,
                run_id: run.id,
            });
        }
        match task.status {
            TaskStatus::Completed => {
                return Err(MissionError::conflict(format!(
                    "task `{task_id}` is already completed"
                )));
            }
            TaskStatus::Blocked => {
                return Err(MissionError::conflict(format!(
                    "task `{task_id}` is blocked; use retry or a circuit reset"
                )));
            }
            TaskStatus::HitlReview => {
                return Err(MissionError::conflict(format!(
                    "task `{task_id}` is waiting for a human decision"
                )));
            }
            _ => {}
        }

        let role_id = self.select_role(&task, explicit_role).await?;
        let now = Utc::now();
        let id = task_id.to_string();
        let owner = role_id.clone();
        self.storage
            .transact(move |state| {
                state.transition(&id, TaskStatus::Orchestrating, now)?;
                Ok(())
            })
            .await?;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("orchestrator", "task.orchestrating")
                .task(task_id)
                .role(&owner),
        );

        let plan = DispatchPlan {
            role_id,
            requester_tenant: requester_tenant
                .map(str::to_string)
                .unwrap_or_else(|| task.tenant_id.clone()),
            sub_prompt: None,
            handoff_kind: HandoffKind::Delegate,
            handoff_from: None,
            reason: "orchestrate".to_string(),
        };
        match self.dispatch_with(task_id, plan, |_| Ok(())).await {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                if let Err(revert_err) = self.release_orchestrating(task_id).await {
                    tracing::warn!(
                        task_id = %task_id,
                        "failed to return task to intake after dispatch error: {revert_err}"
                    );
                }
                Err(err)
            }
        }
    }

    /// Puts a task stuck in `orchestrating` back to `intake` so a later trigger can pick it up.
    pub(crate) async fn release_orchestrating(&self, task_id: &str) -> MissionResult<()> {
        let id = task_id.to_string();
        self.storage
            .transact(move |state| {
                if state.task(&id)?.status == TaskStatus::Orchestrating {
                    state.transition(&id, TaskStatus::Intake, Utc::now())?;
                }
                Ok(())
            })
            .await
    }

    /// Sends a freshly composed prompt to a role, with any pending revision note injected.
    pub async fn dispatch(
        &self,
        task_id: &str,
        requester_tenant: Option<&str>,
        target_role: Option<&str>,
        sub_prompt: Option<String>,
    ) -> MissionResult<DispatchReceipt> {
        let task = self.visible_task(task_id, requester_tenant).await?;
        let role_id = self.select_role(&task, target_role).await?;
        let plan = DispatchPlan {
            role_id,
            requester_tenant: requester_tenant
                .map(str::to_string)
                .unwrap_or_else(|| task.tenant_id.clone()),
            sub_prompt,
            handoff_kind: HandoffKind::Delegate,
            handoff_from: None,
            reason: "dispatch".to_string(),
        };
        self.dispatch_with(task_id, plan, |_| Ok(())).await
    }

    /// Re-dispatches a failed or blocked task to its owner. The loop never retries on its own.
    pub async fn retry(
        &self,
        task_id: &str,
        requester_tenant: Option<&str>,
    ) -> MissionResult<DispatchReceipt> {
        let task = self.visible_task(task_id, requester_tenant).await?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Blocked) {
            return Err(MissionError::conflict(format!(
                "only failed or blocked tasks can be retried (task `{task_id}` is {})",
                task.status
            )));
        }
        let role_id = self.select_role(&task, None).await?;
        let plan = DispatchPlan {
            role_id,
            requester_tenant: requester_tenant
                .map(str::to_string)
                .unwrap_or_else(|| task.tenant_id.clone()),
            sub_prompt: None,
            handoff_kind: HandoffKind::Delegate,
            handoff_from: None,
            reason: format!("retry after {}", task.status),
        };
        let id = task_id.to_string();
        self.dispatch_with(task_id, plan, move |state| {
            state.close_open_runs(&id, RunStatus::Archived, Utc::now());
            Ok(())
        })
        .await
    }

    /// Raises the interrupt budget above the current count and unblocks the task.
    /// `interrupt_count` itself is never lowered.
    pub async fn reset_circuit(
        &self,
        task_id: &str,
        operator: &str,
        extra_interrupts: Option<u32>,
    ) -> MissionResult<Task> {
        let operator = operator.trim();
        if operator.is_empty() {
            return Err(MissionError::invalid("operator is required"));
        }
        let cfg = self.config.get().await;
        let extra = extra_interrupts
            .unwrap_or(cfg.execution.default_max_interrupts)
            .max(1);
        let now = Utc::now();
        let id = task_id.to_string();
        let actor = format!("hitl:{operator}");
        let task = self
            .storage
            .transact(move |state| {
                let task = state.task_mut(&id)?;
                task.max_interrupts = task
                    .max_interrupts
                    .max(task.interrupt_count.saturating_add(extra));
                task.updated_at = now;
                let owner = task.owner_role_id.clone();
                let was_blocked = task.status == TaskStatus::Blocked;
                if was_blocked {
                    state.transition(&id, TaskStatus::Intake, now)?;
                }
                state.handoffs.push(Handoff::new(
                    &id,
                    actor,
                    owner,
                    HandoffKind::Delegate,
                    "circuit breaker reset",
                    now,
                ));
                Ok(state.task(&id)?.clone())
            })
            .await?;

        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent::new("replan", "circuit.reset")
                .task(task_id)
                .status(task.status.as_str())
                .detail(operator),
        );
        self.event_bus.emit(
            "circuit.reset",
            json!({
                "taskID": task_id,
                "operator": operator,
                "interruptCount": task.interrupt_count,
                "maxInterrupts": task.max_interrupts,
            }),
        );
        Ok(task)
    }

    /// Creates the run and moves the task to `in_execution` in one transaction, then spawns the
    /// execution loop. `prepare` runs first inside the same transaction.
    pub(crate) async fn dispatch_with<F>(
        &self,
        task_id: &str,
        plan: DispatchPlan,
        prepare: F,
    ) -> MissionResult<DispatchReceipt>
    where
        F: FnOnce(&mut StoreState) -> MissionResult<()>,
    {
        let DispatchPlan {
            role_id,
            requester_tenant,
            sub_prompt,
            handoff_kind,
            handoff_from,
            reason,
        } = plan;
        let now = Utc::now();
        let id = task_id.to_string();
        let owner = role_id.clone();
        let (run, task, revision_note) = self
            .storage
            .transact(move |state| {
                prepare(state)?;
                if let Some(running) = state.running_run_for(&id) {
                    return Err(MissionError::conflict(format!(
                        "task `{id}` already has running run `{}`",
                        running.id
                    )));
                }
                state.transition(&id, TaskStatus::InExecution, now)?;
                let task = state.task_mut(&id)?;
                let previous = std::mem::replace(&mut task.owner_role_id, owner.clone());
                let revision_note = task.revision_note.take();
                let task = task.clone();

                let run = Run::start(&id, &owner, requester_tenant, now);
                state.runs.insert(run.id.clone(), run.clone());

                let from = handoff_from.unwrap_or_else(|| {
                    if previous.trim().is_empty() {
                        "orchestrator".to_string()
                    } else {
                        previous
                    }
                });
                state.handoffs.push(Handoff::new(
                    &id,
                    from,
                    &owner,
                    handoff_kind,
                    reason,
                    now,
                ));
                Ok((run, task, revision_note))
            })
            .await?;

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("orchestrator", "task.dispatched")
                .task(task_id)
                .run(&run.id)
                .role(&role_id),
        );
        self.event_bus.emit(
            "task.dispatched",
            json!({"taskID": task_id, "runID": run.id, "roleID": role_id}),
        );

        let request = RunRequest {
            task_id: task.id.clone(),
            run_id: run.id.clone(),
            role_id: role_id.clone(),
            session_key: run.session_key.clone(),
            task_title: task.title.clone(),
            objective: task.objective.clone(),
            sub_prompt,
            revision_note,
        };
        let engine = self.engine.clone();
        let guard = self.side_effects.in_flight().enter();
        tokio::spawn(async move {
            let outcome = engine.run(request).await;
            tracing::debug!(?outcome, "run finished");
            drop(guard);
        });

        Ok(DispatchReceipt {
            status: task.status,
            owner_role_id: role_id,
            run_id: run.id,
        })
    }

    async fn select_role(&self, task: &Task, explicit: Option<&str>) -> MissionResult<String> {
        if let Some(role_id) = explicit.map(str::trim).filter(|r| !r.is_empty()) {
            if !self.roles.exists(role_id).await {
                return Err(MissionError::invalid(format!("unknown role `{role_id}`")));
            }
            return Ok(role_id.to_string());
        }
        let owner = task.owner_role_id.trim();
        if !owner.is_empty() && self.roles.exists(owner).await {
            return Ok(owner.to_string());
        }
        Ok(self.roles.route(&task.title, &task.objective).await.id)
    }

    /// Tasks of another tenant are reported as missing.
    pub(crate) async fn visible_task(
        &self,
        task_id: &str,
        requester_tenant: Option<&str>,
    ) -> MissionResult<Task> {
        let task = self
            .storage
            .get_task(task_id)
            .await
            .ok_or_else(|| MissionError::not_found("task", task_id))?;
        match requester_tenant.map(str::trim).filter(|t| !t.is_empty()) {
            Some(tenant) if tenant != task.tenant_id => {
                Err(MissionError::not_found("task", task_id))
            }
            _ => Ok(task),
        }
    }
}
