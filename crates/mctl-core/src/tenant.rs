//! Tenant isolation guard. Runs before policy on every tool call and cannot be downgraded.

use serde_json::Value;

use crate::ExecutionError;

/// Task id argument a tool call may target, if any.
pub fn targeted_task_id(args: &Value) -> Option<&str> {
    args.get("task_id")
        .or_else(|| args.get("taskId"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

pub fn enforce(requester_tenant: &str, owning_tenant: &str) -> Result<(), ExecutionError> {
    let requester = requester_tenant.trim();
    let owner = owning_tenant.trim();
    if requester.is_empty() || requester != owner {
        return Err(ExecutionError::TenantIsolation {
            requester: requester.to_string(),
            owner: owner.to_string(),
        });
    }
    Ok(())
}
