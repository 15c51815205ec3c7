use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::Level;

use mctl_observability::{emit_event, summarize, ObservabilityEvent, ProcessKind, TraceSummary, Tracer};
use mctl_types::{
    Approval, Handoff, Insight, NewInsight, NewTask, Review, Run, Task, TaskOrigin,
};

use crate::{
    classify, load_policy, notifier_from_config, peer_from_config, spawn_side_effect_worker,
    ArtifactStore, ConfigStore, EngineLoop, EventBus, LlmPeer, MissionError, MissionResult,
    Notification, Notifier, PolicyContext, PolicySource, PolicyVerdict, RoleRegistry, SideEffect,
    SideEffectHandler, SideEffectQueue, Storage, ToolRegistry,
};

/// A task with everything recorded against it.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub task: Task,
    pub children: Vec<Task>,
    pub runs: Vec<Run>,
    pub approvals: Vec<Approval>,
    pub handoffs: Vec<Handoff>,
    pub insights: Vec<Insight>,
    pub reviews: Vec<Review>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyDryRun {
    pub tool: String,
    #[serde(flatten)]
    pub verdict: PolicyVerdict,
    pub source: PolicySource,
    pub untrusted: bool,
}

/// Shared handle to the orchestration core. Cheap to clone.
#[derive(Clone)]
pub struct MissionControl {
    pub(crate) storage: Arc<Storage>,
    pub(crate) event_bus: EventBus,
    pub(crate) config: ConfigStore,
    pub(crate) roles: RoleRegistry,
    pub(crate) tools: ToolRegistry,
    pub(crate) tracer: Arc<Tracer>,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) side_effects: SideEffectQueue,
    pub(crate) engine: EngineLoop,
    pub(crate) state_dir: PathBuf,
}

impl MissionControl {
    /// Builds the core with the peer and notifier named in the effective config.
    pub async fn bootstrap(state_dir: &Path, config: ConfigStore) -> anyhow::Result<Self> {
        let cfg = config.get().await;
        let peer = peer_from_config(&cfg.peer);
        let notifier = notifier_from_config(&cfg.notifications);
        tracing::info!(
            peer = peer.name(),
            notifier = notifier.name(),
            state_dir = %state_dir.display(),
            "mission control starting"
        );
        Self::new(state_dir, config, peer, notifier).await
    }

    pub async fn new(
        state_dir: &Path,
        config: ConfigStore,
        peer: Arc<dyn LlmPeer>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        let cfg = config.get().await;
        let storage = Arc::new(Storage::new(state_dir).await?);
        let roles = RoleRegistry::new(state_dir, &cfg.workflow.default_role).await?;
        let tools = ToolRegistry::with_builtins(storage.clone()).await;
        let tracer = Arc::new(Tracer::in_state_dir(state_dir));
        let artifacts = ArtifactStore::new(state_dir);
        let event_bus = EventBus::new();
        let (side_effects, receiver) = SideEffectQueue::channel();
        let engine = EngineLoop::new(
            storage.clone(),
            event_bus.clone(),
            roles.clone(),
            tools.clone(),
            peer,
            tracer.clone(),
            artifacts.clone(),
            side_effects.clone(),
            config.clone(),
            state_dir,
        );
        let mc = Self {
            storage,
            event_bus: event_bus.clone(),
            config,
            roles,
            tools,
            tracer,
            artifacts,
            notifier,
            side_effects,
            engine,
            state_dir: state_dir.to_path_buf(),
        };
        spawn_side_effect_worker(
            receiver,
            Arc::new(mc.clone()),
            event_bus,
            cfg.execution.side_effect_max_attempts,
        );
        Ok(mc)
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn side_effects(&self) -> &SideEffectQueue {
        &self.side_effects
    }

    /// Waits until every queued side effect and spawned run has finished.
    pub async fn settle(&self) {
        self.side_effects.in_flight().wait_idle().await;
    }

    pub async fn create_task(&self, input: NewTask, auto_orchestrate: bool) -> MissionResult<Task> {
        let cfg = self.config.get().await;
        let mut input = input;
        input.title = input.title.trim().to_string();
        input.objective = input.objective.trim().to_string();
        input.tenant_id = input.tenant_id.trim().to_string();
        if input.title.is_empty() {
            return Err(MissionError::invalid("title must not be empty"));
        }
        if input.tenant_id.is_empty() {
            input.tenant_id = cfg.workflow.default_tenant.clone();
        }
        let owner = input.owner_role_id.trim().to_string();
        if !owner.is_empty() && !self.roles.exists(&owner).await {
            return Err(MissionError::invalid(format!("unknown role `{owner}`")));
        }
        input.owner_role_id = owner;

        let task = Task::new(input, Utc::now());
        let stored = task.clone();
        self.storage
            .transact(move |state| {
                if let Some(parent_id) = stored.parent_id.as_deref() {
                    let parent = state.task(parent_id)?;
                    if parent.tenant_id != stored.tenant_id {
                        return Err(MissionError::invalid(
                            "child task must belong to the parent's tenant",
                        ));
                    }
                }
                state.tasks.insert(stored.id.clone(), stored);
                Ok(())
            })
            .await?;

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("intake", "task.created")
                .task(&task.id)
                .status(task.status.as_str()),
        );
        self.event_bus.emit(
            "task.created",
            json!({"taskID": task.id, "tenantID": task.tenant_id, "origin": task.origin}),
        );
        if auto_orchestrate {
            self.side_effects.enqueue(SideEffect::Orchestrate {
                task_id: task.id.clone(),
            });
        }
        Ok(task)
    }

    pub async fn get_task_detail(&self, task_id: &str) -> MissionResult<TaskDetail> {
        let task = self
            .storage
            .get_task(task_id)
            .await
            .ok_or_else(|| MissionError::not_found("task", task_id))?;
        Ok(TaskDetail {
            children: self.storage.children(task_id).await,
            runs: self.storage.runs_for_task(task_id).await,
            approvals: self.storage.approvals_for_task(task_id).await,
            handoffs: self.storage.handoffs_for_task(task_id).await,
            insights: self.storage.insights_for_task(task_id).await,
            reviews: self.storage.reviews_for_task(task_id).await,
            task,
        })
    }

    /// Records an insight. S2/S3 queue a replan and return without waiting for it.
    pub async fn submit_insight(&self, input: NewInsight) -> MissionResult<Insight> {
        if input.claim.trim().is_empty() {
            return Err(MissionError::invalid("claim must not be empty"));
        }
        let insight = Insight::new(input, Utc::now());
        let stored = insight.clone();
        self.storage
            .transact(move |state| {
                state.task(&stored.parent_task_id)?;
                state.insights.push(stored);
                Ok(())
            })
            .await?;

        let replan = insight.severity.triggers_replan();
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("replan", "insight.received")
                .task(&insight.parent_task_id)
                .status(if replan { "replan_queued" } else { "recorded" }),
        );
        self.event_bus.emit(
            "insight.created",
            json!({
                "insightID": insight.id,
                "parentTaskID": insight.parent_task_id,
                "severity": insight.severity,
            }),
        );
        if replan {
            self.side_effects.enqueue(SideEffect::Replan {
                insight_id: insight.id.clone(),
            });
        }
        Ok(insight)
    }

    /// Policy decision for a hypothetical tool call, using the live policy file.
    pub async fn classify_tool(
        &self,
        tool: &str,
        args: &Value,
        origin: TaskOrigin,
    ) -> PolicyDryRun {
        let cfg = self.config.get().await;
        let (policy, source) = load_policy(&cfg.policy_path(&self.state_dir)).await;
        let ctx = PolicyContext::new(origin, cfg.policy.trusted_identities.clone());
        PolicyDryRun {
            tool: tool.to_string(),
            verdict: classify(tool, args, &ctx, &policy),
            source,
            untrusted: ctx.is_untrusted(),
        }
    }

    pub async fn trace_summary(&self) -> anyhow::Result<TraceSummary> {
        let spans = self.tracer.read_spans().await?;
        Ok(summarize(&spans))
    }

    pub(crate) fn notify(&self, notification: Notification) {
        self.side_effects
            .enqueue(SideEffect::Notify { notification });
    }

    async fn deliver_master_report(&self, task_id: &str) -> anyhow::Result<()> {
        let Some(task) = self.storage.get_task(task_id).await else {
            anyhow::bail!("task `{task_id}` vanished before delivery");
        };
        let body = self
            .storage
            .runs_for_task(task_id)
            .await
            .into_iter()
            .rev()
            .find_map(|run| run.output_summary)
            .unwrap_or_default();
        let path = self
            .artifacts
            .write_deliverable(&task, &body, None, Utc::now())
            .await?;
        self.notifier
            .notify(&Notification::info(
                format!("Report ready: {}", task.title),
                body,
                task_id,
            ))
            .await?;
        self.event_bus.emit(
            "report.delivered",
            json!({"taskID": task_id, "artifact": path.display().to_string()}),
        );
        Ok(())
    }
}

#[async_trait]
impl SideEffectHandler for MissionControl {
    async fn handle(&self, effect: &SideEffect) -> anyhow::Result<()> {
        match effect {
            SideEffect::Orchestrate { task_id } => {
                match self.orchestrate(task_id, None, None).await {
                    Ok(_) => Ok(()),
                    // Someone else moved the task first; nothing to retry.
                    Err(MissionError::Conflict(reason)) => {
                        tracing::info!(task_id = %task_id, "auto-orchestration skipped: {reason}");
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                }
            }
            SideEffect::FanIn { task_id } => {
                self.evaluate_fan_in(task_id).await?;
                Ok(())
            }
            SideEffect::FanInParent { parent_id } => {
                self.evaluate_parent(parent_id).await?;
                Ok(())
            }
            SideEffect::Replan { insight_id } => {
                self.apply_replan(insight_id).await?;
                Ok(())
            }
            SideEffect::Notify { notification } => self.notifier.notify(notification).await,
            SideEffect::Deliver { task_id } => self.deliver_master_report(task_id).await,
        }
    }
}
