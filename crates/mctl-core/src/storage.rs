use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use mctl_types::{
    Approval, ApprovalStatus, Handoff, Insight, Review, Run, RunStatus, Task, TaskStatus,
};

use crate::{MissionError, MissionResult};

const STORE_FILE: &str = "store.json";

/// Every persisted record. Task statuses pass through the legacy decoder on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub tasks: HashMap<String, Task>,
    #[serde(default)]
    pub runs: HashMap<String, Run>,
    #[serde(default)]
    pub approvals: HashMap<String, Approval>,
    #[serde(default)]
    pub handoffs: Vec<Handoff>,
    #[serde(default)]
    pub insights: Vec<Insight>,
    #[serde(default)]
    pub reviews: Vec<Review>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurgeReport {
    pub runs: usize,
    pub approvals: usize,
    pub handoffs: usize,
    pub insights: usize,
    pub reviews: usize,
}

impl StoreState {
    pub fn task(&self, id: &str) -> MissionResult<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| MissionError::not_found("task", id))
    }

    pub fn task_mut(&mut self, id: &str) -> MissionResult<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| MissionError::not_found("task", id))
    }

    pub fn run_mut(&mut self, id: &str) -> MissionResult<&mut Run> {
        self.runs
            .get_mut(id)
            .ok_or_else(|| MissionError::not_found("run", id))
    }

    /// Moves a task along the pipeline, rejecting edges the state machine does not allow.
    pub fn transition(
        &mut self,
        id: &str,
        target: TaskStatus,
        now: DateTime<Utc>,
    ) -> MissionResult<TaskStatus> {
        let task = self.task_mut(id)?;
        let from = task.status;
        if !from.can_transition_to(target) {
            return Err(MissionError::conflict(format!(
                "task `{id}` cannot move from {from} to {target}"
            )));
        }
        task.status = target;
        task.updated_at = now;
        Ok(from)
    }

    /// Like [`StoreState::transition`] but leaves the task untouched when the edge is not allowed.
    pub fn try_transition(
        &mut self,
        id: &str,
        target: TaskStatus,
        now: DateTime<Utc>,
    ) -> MissionResult<bool> {
        let task = self.task_mut(id)?;
        if !task.status.can_transition_to(target) {
            return Ok(false);
        }
        task.status = target;
        task.updated_at = now;
        Ok(true)
    }

    pub fn children_of(&self, parent_id: &str) -> Vec<&Task> {
        let mut children = self
            .tasks
            .values()
            .filter(|task| task.parent_id.as_deref() == Some(parent_id))
            .collect::<Vec<_>>();
        children.sort_by(|a, b| {
            a.execution_order
                .cmp(&b.execution_order)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        children
    }

    pub fn descendant_ids(&self, root_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([root_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for child in self.children_of(&current) {
                out.push(child.id.clone());
                queue.push_back(child.id.clone());
            }
        }
        out
    }

    pub fn running_run_for(&self, task_id: &str) -> Option<&Run> {
        self.runs
            .values()
            .find(|run| run.task_id == task_id && run.status == RunStatus::Running)
    }

    pub fn pending_approval_for(&self, task_id: &str) -> Option<&Approval> {
        self.approvals
            .values()
            .find(|a| a.task_id == task_id && a.status == ApprovalStatus::Pending)
    }

    pub fn latest_review_for(&self, task_id: &str) -> Option<&Review> {
        self.reviews
            .iter()
            .filter(|review| review.task_id == task_id)
            .max_by_key(|review| review.created_at)
    }

    /// Closes every open run of a task with the given terminal status.
    pub fn close_open_runs(
        &mut self,
        task_id: &str,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> usize {
        let mut closed = 0;
        for run in self.runs.values_mut() {
            if run.task_id == task_id && run.status.is_open() {
                run.status = status;
                run.ended_at = Some(now);
                closed += 1;
            }
        }
        closed
    }

    pub fn purge_task(&mut self, task_id: &str) -> MissionResult<PurgeReport> {
        if self.tasks.remove(task_id).is_none() {
            return Err(MissionError::not_found("task", task_id));
        }
        let mut report = PurgeReport::default();
        let before = self.runs.len();
        self.runs.retain(|_, run| run.task_id != task_id);
        report.runs = before - self.runs.len();
        let before = self.approvals.len();
        self.approvals.retain(|_, a| a.task_id != task_id);
        report.approvals = before - self.approvals.len();
        let before = self.handoffs.len();
        self.handoffs.retain(|h| h.task_id != task_id);
        report.handoffs = before - self.handoffs.len();
        let before = self.insights.len();
        self.insights.retain(|i| i.parent_task_id != task_id);
        report.insights = before - self.insights.len();
        let before = self.reviews.len();
        self.reviews.retain(|r| r.task_id != task_id);
        report.reviews = before - self.reviews.len();
        Ok(report)
    }
}

pub struct Storage {
    base: PathBuf,
    state: RwLock<StoreState>,
}

impl Storage {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let store_file = base.join(STORE_FILE);
        let state = if store_file.exists() {
            let raw = fs::read_to_string(&store_file).await?;
            serde_json::from_str::<StoreState>(&raw)
                .with_context(|| format!("failed to parse {}", store_file.display()))?
        } else {
            StoreState::default()
        };
        Ok(Self {
            base,
            state: RwLock::new(state),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Applies `apply` to a copy of the state and commits it only if it returns `Ok` and the
    /// snapshot reaches disk. Concurrent transactions are serialized by the write lock.
    pub async fn transact<T, F>(&self, apply: F) -> MissionResult<T>
    where
        F: FnOnce(&mut StoreState) -> MissionResult<T>,
    {
        let mut guard = self.state.write().await;
        let mut draft = guard.clone();
        let out = apply(&mut draft)?;
        self.write_snapshot(&draft).await?;
        *guard = draft;
        Ok(out)
    }

    pub async fn read<T>(&self, view: impl FnOnce(&StoreState) -> T) -> T {
        let guard = self.state.read().await;
        view(&guard)
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.state.read().await.tasks.get(id).cloned()
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks = self
            .state
            .read()
            .await
            .tasks
            .values()
            .cloned()
            .collect::<Vec<_>>();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub async fn children(&self, parent_id: &str) -> Vec<Task> {
        self.read(|state| state.children_of(parent_id).into_iter().cloned().collect())
            .await
    }

    pub async fn get_run(&self, id: &str) -> Option<Run> {
        self.state.read().await.runs.get(id).cloned()
    }

    pub async fn runs_for_task(&self, task_id: &str) -> Vec<Run> {
        let mut runs = self
            .state
            .read()
            .await
            .runs
            .values()
            .filter(|run| run.task_id == task_id)
            .cloned()
            .collect::<Vec<_>>();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    pub async fn get_approval(&self, id: &str) -> Option<Approval> {
        self.state.read().await.approvals.get(id).cloned()
    }

    pub async fn approvals_for_task(&self, task_id: &str) -> Vec<Approval> {
        let mut approvals = self
            .state
            .read()
            .await
            .approvals
            .values()
            .filter(|a| a.task_id == task_id)
            .cloned()
            .collect::<Vec<_>>();
        approvals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        approvals
    }

    pub async fn handoffs_for_task(&self, task_id: &str) -> Vec<Handoff> {
        self.read(|state| {
            state
                .handoffs
                .iter()
                .filter(|h| h.task_id == task_id)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn get_insight(&self, id: &str) -> Option<Insight> {
        self.read(|state| state.insights.iter().find(|i| i.id == id).cloned())
            .await
    }

    pub async fn insights_for_task(&self, task_id: &str) -> Vec<Insight> {
        self.read(|state| {
            state
                .insights
                .iter()
                .filter(|i| i.parent_task_id == task_id)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn reviews_for_task(&self, task_id: &str) -> Vec<Review> {
        self.read(|state| {
            state
                .reviews
                .iter()
                .filter(|r| r.task_id == task_id)
                .cloned()
                .collect()
        })
        .await
    }

    async fn write_snapshot(&self, state: &StoreState) -> anyhow::Result<()> {
        let payload = serde_json::to_string_pretty(state)?;
        let target = self.base.join(STORE_FILE);
        let tmp = self.base.join(format!("{STORE_FILE}.tmp"));
        fs::write(&tmp, payload)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mctl_types::NewTask;
    use uuid::Uuid;

    fn temp_base() -> PathBuf {
        std::env::temp_dir().join(format!("mctl-storage-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn failed_transaction_leaves_state_untouched() {
        let storage = Storage::new(temp_base()).await.expect("storage");
        let task = Task::new(NewTask::new("t", "o", "acme"), Utc::now());
        let id = task.id.clone();
        storage
            .transact(|state| {
                state.tasks.insert(task.id.clone(), task);
                Ok(())
            })
            .await
            .expect("insert");

        let result: MissionResult<()> = storage
            .transact(|state| {
                state.task_mut(&id)?.interrupt_count = 7;
                Err(MissionError::conflict("abort"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(storage.get_task(&id).await.expect("task").interrupt_count, 0);
    }

    #[tokio::test]
    async fn reload_normalizes_legacy_status_strings() {
        let base = temp_base();
        std::fs::create_dir_all(&base).expect("dir");
        let now = Utc::now();
        let mut task = serde_json::to_value(Task::new(NewTask::new("t", "o", "acme"), now))
            .expect("json");
        task["status"] = serde_json::Value::String("In Progress".to_string());
        let id = task["id"].as_str().expect("id").to_string();
        let mut tasks = serde_json::Map::new();
        tasks.insert(id.clone(), task);
        let raw = serde_json::json!({ "tasks": tasks });
        std::fs::write(base.join(STORE_FILE), raw.to_string()).expect("write");

        let storage = Storage::new(&base).await.expect("storage");
        let loaded = storage.get_task(&id).await.expect("task");
        assert_eq!(loaded.status, TaskStatus::InExecution);
    }

    #[tokio::test]
    async fn transitions_follow_the_state_machine() {
        let storage = Storage::new(temp_base()).await.expect("storage");
        let mut task = Task::new(NewTask::new("t", "o", "acme"), Utc::now());
        task.status = TaskStatus::HitlReview;
        let id = task.id.clone();
        storage
            .transact(|state| {
                state.tasks.insert(id.clone(), task);
                Ok(())
            })
            .await
            .expect("insert");

        let err = storage
            .transact(|state| state.transition(&id, TaskStatus::Failed, Utc::now()))
            .await
            .expect_err("hitl_review must not fall to failed");
        assert!(matches!(err, MissionError::Conflict(_)));
        let moved = storage
            .transact(|state| state.try_transition(&id, TaskStatus::Failed, Utc::now()))
            .await
            .expect("try");
        assert!(!moved);
    }

    #[tokio::test]
    async fn descendants_are_collected_breadth_first() {
        let storage = Storage::new(temp_base()).await.expect("storage");
        let now = Utc::now();
        let root = Task::new(NewTask::new("root", "o", "acme"), now);
        let mut child_input = NewTask::new("child", "o", "acme");
        child_input.parent_id = Some(root.id.clone());
        let child = Task::new(child_input, now);
        let mut grandchild_input = NewTask::new("grandchild", "o", "acme");
        grandchild_input.parent_id = Some(child.id.clone());
        let grandchild = Task::new(grandchild_input, now);
        let expected = vec![child.id.clone(), grandchild.id.clone()];
        let root_id = root.id.clone();
        storage
            .transact(|state| {
                for task in [root, child, grandchild] {
                    state.tasks.insert(task.id.clone(), task);
                }
                Ok(())
            })
            .await
            .expect("insert");
        let found = storage.read(|state| state.descendant_ids(&root_id)).await;
        assert_eq!(found, expected);
    }
}
