use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const GATE_EXECUTION_COMPLETED: &str = "execution_completed_needs_review";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub gate_reason: String,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

impl Approval {
    pub fn pending(
        task_id: impl Into<String>,
        run_id: Option<String>,
        gate_reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: crate::new_id("apr"),
            task_id: task_id.into(),
            run_id,
            gate_reason: gate_reason.into(),
            status: ApprovalStatus::Pending,
            decision_note: None,
            decided_by: None,
            created_at: now,
            decided_at: None,
        }
    }

    pub fn policy_reason(reason: &str) -> String {
        format!("policy:{reason}")
    }
}
