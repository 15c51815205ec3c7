use std::time::Duration;

use thiserror::Error;

/// Fatal outcomes of one execution-loop run. Each one fails the run and writes an error report.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("LLM peer did not finish within {0:?}")]
    Timeout(Duration),
    #[error("LLM peer lifecycle error: {0}")]
    PeerLifecycle(String),
    #[error("tool loop exceeded the limit of {limit} calls")]
    ToolLoopLimit { limit: usize },
    #[error("tool `{tool}` blocked by policy: {reason}")]
    PolicyBlocked { tool: String, reason: String },
    #[error("tenant `{requester}` may not act on a task owned by tenant `{owner}`")]
    TenantIsolation { requester: String, owner: String },
    #[error("{kind} `{id}` not found")]
    MissingRecord { kind: &'static str, id: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Timeout(_) => "LLM_TIMEOUT",
            ExecutionError::PeerLifecycle(_) => "LLM_LIFECYCLE_ERROR",
            ExecutionError::ToolLoopLimit { .. } => "TOOL_LOOP_LIMIT",
            ExecutionError::PolicyBlocked { .. } => "POLICY_BLOCK",
            ExecutionError::TenantIsolation { .. } => "TENANT_ISOLATION_BLOCK",
            ExecutionError::MissingRecord { .. } => "MISSING_RECORD",
            ExecutionError::Internal(_) => "ENGINE_INTERNAL",
        }
    }
}

impl From<MissionError> for ExecutionError {
    fn from(err: MissionError) -> Self {
        match err {
            MissionError::NotFound { kind, id } => ExecutionError::MissingRecord { kind, id },
            MissionError::Internal(inner) => ExecutionError::Internal(inner),
            other => ExecutionError::Internal(anyhow::anyhow!(other.to_string())),
        }
    }
}

/// Service-level failures surfaced to callers of the orchestration API.
#[derive(Debug, Error)]
pub enum MissionError {
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MissionError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        MissionError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        MissionError::Conflict(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        MissionError::InvalidInput(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            MissionError::NotFound { .. } => "NOT_FOUND",
            MissionError::Conflict(_) => "CONFLICT",
            MissionError::InvalidInput(_) => "INVALID_INPUT",
            MissionError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type MissionResult<T> = Result<T, MissionError>;
