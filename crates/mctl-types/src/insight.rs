use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    S0,
    S1,
    S2,
    S3,
}

impl Severity {
    /// S2 and S3 interrupt the plan; lower severities are informational.
    pub fn triggers_replan(self) -> bool {
        matches!(self, Severity::S2 | Severity::S3)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub parent_task_id: String,
    #[serde(default)]
    pub status: String,
    pub claim: String,
    pub severity: Severity,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    #[serde(default)]
    pub affected_tasks: Vec<String>,
    #[serde(default)]
    pub suggested_next_tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_role: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewInsight {
    pub parent_task_id: String,
    #[serde(default)]
    pub status: String,
    pub claim: String,
    pub severity: Severity,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    #[serde(default)]
    pub affected_tasks: Vec<String>,
    #[serde(default)]
    pub suggested_next_tasks: Vec<String>,
    #[serde(default)]
    pub source_role: Option<String>,
}

impl Insight {
    pub fn new(input: NewInsight, now: DateTime<Utc>) -> Self {
        Self {
            id: crate::new_id("ins"),
            parent_task_id: input.parent_task_id,
            status: input.status,
            claim: input.claim,
            severity: input.severity,
            evidence_refs: input.evidence_refs,
            affected_tasks: input.affected_tasks,
            suggested_next_tasks: input.suggested_next_tasks,
            source_role: input.source_role,
            created_at: now,
        }
    }
}
