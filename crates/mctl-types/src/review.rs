use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approve,
    NeedsRevision,
    Block,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approve => "APPROVE",
            Verdict::NeedsRevision => "NEEDS_REVISION",
            Verdict::Block => "BLOCK",
        }
    }
}

/// A verifier's verdict on a task. The latest review per task decides fan-in eligibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub task_id: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub reviewer: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub affected_tasks: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewReview {
    pub task_id: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub reviewer: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub affected_tasks: Vec<String>,
}

impl Review {
    pub fn new(input: NewReview, now: DateTime<Utc>) -> Self {
        Self {
            id: crate::new_id("rev"),
            task_id: input.task_id,
            verdict: input.verdict,
            reviewer: input.reviewer,
            summary: input.summary,
            affected_tasks: input.affected_tasks,
            created_at: now,
        }
    }
}
