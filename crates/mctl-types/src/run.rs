use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    HitlReview,
    /// Closed by ghost-run reconciliation.
    Archived,
}

impl RunStatus {
    pub fn is_open(self) -> bool {
        matches!(
            self,
            RunStatus::Queued | RunStatus::Running | RunStatus::HitlReview
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub task_id: String,
    pub role_id: String,
    pub session_key: String,
    pub status: RunStatus,
    /// Tenant of whoever triggered this run; checked against task tenants on every tool call.
    pub requester_tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Run {
    pub fn start(
        task_id: impl Into<String>,
        role_id: impl Into<String>,
        requester_tenant: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let task_id = task_id.into();
        let role_id = role_id.into();
        let id = crate::new_id("run");
        let session_key = format!("mctl:{role_id}:{task_id}:{id}");
        Self {
            id,
            task_id,
            role_id,
            session_key,
            status: RunStatus::Running,
            requester_tenant: requester_tenant.into(),
            prompt: None,
            stream_id: None,
            started_at: now,
            ended_at: None,
            output_summary: None,
            error_message: None,
        }
    }
}
