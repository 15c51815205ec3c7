//! Decode table for task status strings written by older schemas.
//!
//! Kept separate from [`crate::TaskStatus`] so it can be deleted once historical rows are
//! migrated. Unknown values decode to `intake`.

use crate::TaskStatus;

const LEGACY_TABLE: &[(&str, TaskStatus)] = &[
    ("pending", TaskStatus::Intake),
    ("new", TaskStatus::Intake),
    ("todo", TaskStatus::Intake),
    ("open", TaskStatus::Intake),
    ("inbox", TaskStatus::Intake),
    ("backlog", TaskStatus::Intake),
    ("queued", TaskStatus::Intake),
    ("planning", TaskStatus::Orchestrating),
    ("routing", TaskStatus::Orchestrating),
    ("triage", TaskStatus::Orchestrating),
    ("assigned", TaskStatus::Orchestrating),
    ("in_progress", TaskStatus::InExecution),
    ("inprogress", TaskStatus::InExecution),
    ("running", TaskStatus::InExecution),
    ("executing", TaskStatus::InExecution),
    ("working", TaskStatus::InExecution),
    ("active", TaskStatus::InExecution),
    ("doing", TaskStatus::InExecution),
    ("dispatched", TaskStatus::InExecution),
    ("review", TaskStatus::HitlReview),
    ("in_review", TaskStatus::HitlReview),
    ("needs_review", TaskStatus::HitlReview),
    ("pending_review", TaskStatus::HitlReview),
    ("awaiting_approval", TaskStatus::HitlReview),
    ("waiting_approval", TaskStatus::HitlReview),
    ("hitl", TaskStatus::HitlReview),
    ("done", TaskStatus::Completed),
    ("complete", TaskStatus::Completed),
    ("finished", TaskStatus::Completed),
    ("accepted", TaskStatus::Completed),
    ("resolved", TaskStatus::Completed),
    ("approved", TaskStatus::Completed),
    ("archived", TaskStatus::Completed),
    ("success", TaskStatus::Completed),
    ("error", TaskStatus::Failed),
    ("errored", TaskStatus::Failed),
    ("timeout", TaskStatus::Failed),
    ("timed_out", TaskStatus::Failed),
    ("cancelled", TaskStatus::Failed),
    ("canceled", TaskStatus::Failed),
    ("stuck", TaskStatus::Blocked),
    ("halted", TaskStatus::Blocked),
    ("paused", TaskStatus::Blocked),
    ("on_hold", TaskStatus::Blocked),
    ("rework", TaskStatus::NeedsUpdate),
    ("revision", TaskStatus::NeedsUpdate),
    ("needs_revision", TaskStatus::NeedsUpdate),
    ("changes_requested", TaskStatus::NeedsUpdate),
    ("rejected", TaskStatus::NeedsUpdate),
    ("stale", TaskStatus::NeedsUpdate),
];

pub fn decode(raw: &str) -> TaskStatus {
    let key = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    if let Some(status) = TaskStatus::from_canonical(&key) {
        return status;
    }
    LEGACY_TABLE
        .iter()
        .find(|(legacy, _)| *legacy == key)
        .map(|(_, status)| *status)
        .unwrap_or(TaskStatus::Intake)
}

/// Terminal-success spellings used by sibling counting in fan-in.
pub fn is_terminal_success(raw: &str) -> bool {
    decode(raw) == TaskStatus::Completed
}
