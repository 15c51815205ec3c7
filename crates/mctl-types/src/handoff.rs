use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffKind {
    Delegate,
    Rework,
    Synthesis,
    UrgentReplan,
    Block,
}

/// Audit edge: which role passed a task to which other role. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub id: String,
    pub task_id: String,
    pub from_role: String,
    pub to_role: String,
    pub kind: HandoffKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl Handoff {
    pub fn new(
        task_id: impl Into<String>,
        from_role: impl Into<String>,
        to_role: impl Into<String>,
        kind: HandoffKind,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: crate::new_id("hof"),
            task_id: task_id.into(),
            from_role: from_role.into(),
            to_role: to_role.into(),
            kind,
            reason: reason.into(),
            created_at: now,
        }
    }
}
