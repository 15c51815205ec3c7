//! Out-of-band cleanup: zombie runs, ghost runs and administrative purges.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::Level;

use mctl_observability::{emit_event, ObservabilityEvent, ProcessKind};
use mctl_types::{RunStatus, TaskStatus};

use crate::{MissionControl, MissionResult, PurgeReport, StoreState};

const ZOMBIE_REPORT: &str = "marked failed by zombie cleanup: no progress within the stale window";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub zombie_tasks: Vec<String>,
    pub zombie_runs: usize,
    pub ghost_runs: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        self.zombie_tasks.is_empty() && self.zombie_runs == 0 && self.ghost_runs == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeSummary {
    pub task_id: String,
    #[serde(flatten)]
    pub records: PurgeReport,
    pub artifacts: usize,
}

/// Fails `in_execution` tasks untouched since `cutoff`, along with their running runs.
/// Returns the ids of the failed tasks and the number of runs closed.
pub fn sweep_zombies(
    state: &mut StoreState,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> MissionResult<(Vec<String>, usize)> {
    let mut stale = state
        .tasks
        .values()
        .filter(|task| task.status == TaskStatus::InExecution && task.updated_at < cutoff)
        .map(|task| task.id.clone())
        .collect::<Vec<_>>();
    stale.sort();

    let mut runs = 0;
    for id in &stale {
        state.transition(id, TaskStatus::Failed, now)?;
        for run in state.runs.values_mut() {
            if run.task_id == *id && run.status == RunStatus::Running {
                run.status = RunStatus::Failed;
                run.ended_at = Some(now);
                run.error_message.get_or_insert_with(|| ZOMBIE_REPORT.to_string());
                runs += 1;
            }
        }
    }
    Ok((stale, runs))
}

/// Archives open runs whose task is terminal or gone.
pub fn reconcile_ghost_runs(state: &mut StoreState, now: DateTime<Utc>) -> usize {
    let mut archived = 0;
    let tasks = &state.tasks;
    for run in state.runs.values_mut() {
        if !run.status.is_open() {
            continue;
        }
        let orphaned = tasks
            .get(&run.task_id)
            .map_or(true, |task| task.status.is_terminal());
        if orphaned {
            run.status = RunStatus::Archived;
            run.ended_at = Some(now);
            archived += 1;
        }
    }
    archived
}

impl MissionControl {
    /// One zombie + ghost sweep using the configured stale window.
    pub async fn run_maintenance(&self) -> MissionResult<MaintenanceReport> {
        let stale_secs = self.config.get().await.execution.zombie_stale_secs;
        let now = Utc::now();
        let stale = i64::try_from(stale_secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
        let cutoff = now - Duration::seconds(stale);
        let report = self
            .storage
            .transact(move |state| {
                let (zombie_tasks, zombie_runs) = sweep_zombies(state, cutoff, now)?;
                let ghost_runs = reconcile_ghost_runs(state, now);
                Ok(MaintenanceReport {
                    zombie_tasks,
                    zombie_runs,
                    ghost_runs,
                })
            })
            .await?;

        if report.is_empty() {
            tracing::debug!("maintenance sweep found nothing");
            return Ok(report);
        }
        for task_id in &report.zombie_tasks {
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent::new("maintenance", "zombie.failed")
                    .task(task_id)
                    .status("failed")
                    .error_code("ZOMBIE_RUN"),
            );
        }
        tracing::info!(
            zombie_tasks = report.zombie_tasks.len(),
            zombie_runs = report.zombie_runs,
            ghost_runs = report.ghost_runs,
            "maintenance sweep applied"
        );
        self.event_bus.emit(
            "maintenance.swept",
            serde_json::to_value(&report).unwrap_or_else(|_| json!({})),
        );
        Ok(report)
    }

    /// Deletes a task with every record and artifact that references it.
    pub async fn purge_task(&self, task_id: &str) -> MissionResult<PurgeSummary> {
        let id = task_id.to_string();
        let records = self
            .storage
            .transact(move |state| state.purge_task(&id))
            .await?;
        let artifacts = match self.artifacts.remove_for_task(task_id).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(task_id, "artifact cleanup failed: {err:#}");
                0
            }
        };
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent::new("maintenance", "task.purged")
                .task(task_id)
                .status("purged"),
        );
        self.event_bus.emit(
            "task.purged",
            json!({"taskID": task_id, "runs": records.runs, "artifacts": artifacts}),
        );
        Ok(PurgeSummary {
            task_id: task_id.to_string(),
            records,
            artifacts,
        })
    }
}
