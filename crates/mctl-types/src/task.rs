use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::legacy_status;

/// Pipeline status of a task. Deserialization goes through the legacy decode table, so any
/// historical free-form value is normalized the moment it is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Intake,
    Orchestrating,
    InExecution,
    HitlReview,
    Completed,
    Failed,
    Blocked,
    NeedsUpdate,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Intake,
        TaskStatus::Orchestrating,
        TaskStatus::InExecution,
        TaskStatus::HitlReview,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Blocked,
        TaskStatus::NeedsUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Intake => "intake",
            TaskStatus::Orchestrating => "orchestrating",
            TaskStatus::InExecution => "in_execution",
            TaskStatus::HitlReview => "hitl_review",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::NeedsUpdate => "needs_update",
        }
    }

    /// Exact match on the canonical spelling only.
    pub fn from_canonical(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == raw)
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Intake
                | TaskStatus::Orchestrating
                | TaskStatus::InExecution
                | TaskStatus::HitlReview
                | TaskStatus::NeedsUpdate
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn allowed_transitions(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Intake => &[Orchestrating, InExecution, Failed, Blocked, NeedsUpdate],
            Orchestrating => &[InExecution, Intake, Failed, Blocked, NeedsUpdate],
            InExecution => &[InExecution, HitlReview, Completed, Failed, Blocked, NeedsUpdate],
            HitlReview => &[Completed, InExecution, Blocked, NeedsUpdate],
            Completed => &[Blocked],
            Failed => &[Orchestrating, InExecution, Intake, Blocked],
            Blocked => &[Intake, Orchestrating, InExecution],
            NeedsUpdate => &[Orchestrating, InExecution, HitlReview, Failed, Blocked],
        }
    }

    pub fn can_transition_to(self, target: TaskStatus) -> bool {
        self == target || self.allowed_transitions().contains(&target)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(legacy_status::decode(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    #[serde(alias = "medium", alias = "p2")]
    Normal,
    #[serde(alias = "p1")]
    High,
    #[serde(alias = "critical", alias = "p0")]
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Standard,
    /// Top-level report task; completes without a human gate.
    Master,
    Synthesis,
    Mitigation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OriginChannel {
    #[default]
    Ui,
    Telegram,
    Webhook,
    Cron,
    Synthesis,
    Replan,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TaskOrigin {
    pub channel: OriginChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TaskOrigin {
    pub fn channel(channel: OriginChannel) -> Self {
        Self {
            channel,
            ..Self::default()
        }
    }

    pub fn is_inbound_messaging(&self) -> bool {
        matches!(
            self.channel,
            OriginChannel::Telegram | OriginChannel::Webhook
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    pub objective: String,
    pub owner_role_id: String,
    #[serde(default)]
    pub priority: Priority,
    pub status: TaskStatus,
    pub tenant_id: String,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub execution_order: i64,
    #[serde(default)]
    pub interrupt_count: u32,
    pub max_interrupts: u32,
    #[serde(default)]
    pub origin: TaskOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_payload: Option<Value>,
    /// Reviewer note waiting to be injected into the next dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(input: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: crate::new_id("task"),
            parent_id: input.parent_id,
            title: input.title,
            objective: input.objective,
            owner_role_id: input.owner_role_id,
            priority: input.priority,
            status: TaskStatus::Intake,
            tenant_id: input.tenant_id,
            kind: input.kind,
            execution_order: input.execution_order,
            interrupt_count: 0,
            max_interrupts: input.max_interrupts,
            origin: input.origin,
            context_payload: input.context_payload,
            revision_note: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Master and synthesis tasks finish without a human gate.
    pub fn is_master(&self) -> bool {
        matches!(self.kind, TaskKind::Master | TaskKind::Synthesis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub objective: String,
    #[serde(default)]
    pub owner_role_id: String,
    #[serde(default)]
    pub priority: Priority,
    pub tenant_id: String,
    #[serde(default)]
    pub origin: TaskOrigin,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub context_payload: Option<Value>,
    #[serde(default)]
    pub execution_order: i64,
    #[serde(default = "default_max_interrupts")]
    pub max_interrupts: u32,
}

fn default_max_interrupts() -> u32 {
    3
}

impl NewTask {
    pub fn new(
        title: impl Into<String>,
        objective: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            objective: objective.into(),
            owner_role_id: String::new(),
            priority: Priority::Normal,
            tenant_id: tenant_id.into(),
            origin: TaskOrigin::default(),
            parent_id: None,
            kind: TaskKind::Standard,
            context_payload: None,
            execution_order: 0,
            max_interrupts: default_max_interrupts(),
        }
    }
}
