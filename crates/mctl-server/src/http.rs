use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use mctl_core::{
    DispatchReceipt, MaintenanceReport, MissionError, PolicyDryRun, PurgeSummary, TaskDetail,
};
use mctl_observability::TraceSummary;
use mctl_types::{
    Approval, EngineEvent, NewInsight, NewReview, NewTask, Priority, Review, Task, TaskOrigin,
};

use crate::webhook::parse_telegram_update;
use crate::AppState;

const TENANT_HEADER: &str = "x-tenant-id";

/// JSON error envelope: `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_INPUT",
            message: message.into(),
        }
    }
}

impl From<MissionError> for ApiError {
    fn from(err: MissionError) -> Self {
        let status = match &err {
            MissionError::NotFound { .. } => StatusCode::NOT_FOUND,
            MissionError::Conflict(_) => StatusCode::CONFLICT,
            MissionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            MissionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {err:#}");
        }
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        MissionError::Internal(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"error": {"code": self.code, "message": self.message}})),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let maintenance = tokio::spawn(maintenance_loop(state.clone()));

    let app = app_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "mission control listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;

    state.set_ready(false);
    maintenance.abort();
    state.settle().await;
    result?;
    Ok(())
}

/// Zombie and ghost-run sweeps. The first pass runs at start-up to clean up after a crash.
async fn maintenance_loop(state: AppState) {
    loop {
        if let Err(err) = state.run_maintenance().await {
            tracing::warn!("maintenance sweep failed: {err}");
        }
        let secs = state
            .config()
            .get()
            .await
            .execution
            .maintenance_interval_secs
            .max(1);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/event", get(events))
        .route("/tasks", post(create_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/orchestrate", post(orchestrate_task))
        .route("/tasks/{id}/dispatch", post(dispatch_task))
        .route("/tasks/{id}/retry", post(retry_task))
        .route("/tasks/{id}/circuit/reset", post(reset_circuit))
        .route("/approvals/{id}/approve", post(approve))
        .route("/approvals/{id}/reject", post(reject))
        .route("/insights", post(submit_insight))
        .route("/reviews", post(submit_review))
        .route("/policy/classify", post(classify_tool))
        .route("/observability/summary", get(observability_summary))
        .route("/webhooks/telegram", post(telegram_webhook))
        .route("/admin/tasks/{id}", delete(purge_task))
        .route("/admin/maintenance/sweep", post(sweep))
        .layer(cors)
        .with_state(state)
}

fn requester_tenant(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Empty bodies decode to `T::default()`; anything else must be valid JSON for `T`.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| ApiError::bad_request(format!("invalid body: {err}")))
}

/// Tasks of other tenants look exactly like missing ones.
async fn task_for(state: &AppState, task_id: &str, tenant: Option<&str>) -> ApiResult<Task> {
    let task = state
        .storage()
        .get_task(task_id)
        .await
        .filter(|task| tenant.map_or(true, |t| t == task.tenant_id))
        .ok_or_else(|| MissionError::not_found("task", task_id))?;
    Ok(task)
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "ready": state.is_ready(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_ms": state.uptime_ms(),
        "event_subscribers": state.event_bus().subscriber_count(),
    }))
}

#[derive(Debug, Deserialize, Default, Clone)]
struct EventFilterQuery {
    #[serde(default, rename = "taskID", alias = "task_id")]
    task_id: Option<String>,
}

async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(sse_stream(state, filter)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

fn sse_stream(
    state: AppState,
    filter: EventFilterQuery,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let rx = state.event_bus().subscribe();
    let initial = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&EngineEvent::new("server.connected", json!({}))).unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) => {
            if !event_matches_filter(&event, &filter) {
                return None;
            }
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    });
    initial.chain(live)
}

fn event_matches_filter(event: &EngineEvent, filter: &EventFilterQuery) -> bool {
    let Some(task_id) = filter.task_id.as_deref() else {
        return true;
    };
    ["taskID", "parentTaskID"].iter().any(|key| {
        event
            .properties
            .get(*key)
            .and_then(Value::as_str)
            .is_some_and(|v| v == task_id)
    })
}

#[derive(Debug, Deserialize)]
struct CreateTaskInput {
    title: String,
    #[serde(default)]
    objective: String,
    #[serde(default)]
    owner_role_id: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    tenant_id: String,
    #[serde(default)]
    origin: TaskOrigin,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    context_payload: Option<Value>,
    #[serde(default)]
    max_interrupts: Option<u32>,
    #[serde(default)]
    auto_orchestrate: bool,
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateTaskInput>,
) -> ApiResult<impl IntoResponse> {
    let header_tenant = requester_tenant(&headers);
    let body_tenant = input.tenant_id.trim().to_string();
    let tenant_id = match (header_tenant, body_tenant.is_empty()) {
        (Some(header), true) => header,
        (Some(header), false) if header != body_tenant => {
            return Err(ApiError::bad_request(
                "tenant_id does not match the x-tenant-id header",
            ));
        }
        _ => body_tenant,
    };
    let default_max_interrupts = state.config().get().await.execution.default_max_interrupts;

    let mut task = NewTask::new(input.title, input.objective, tenant_id);
    task.owner_role_id = input.owner_role_id;
    task.priority = input.priority;
    task.origin = input.origin;
    task.parent_id = input.parent_id;
    task.context_payload = input.context_payload;
    task.max_interrupts = input.max_interrupts.unwrap_or(default_max_interrupts);

    let task = state.create_task(task, input.auto_orchestrate).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"task_id": task.id, "task": task})),
    ))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<TaskDetail>> {
    let tenant = requester_tenant(&headers);
    task_for(&state, &id, tenant.as_deref()).await?;
    Ok(Json(state.get_task_detail(&id).await?))
}

#[derive(Debug, Deserialize, Default)]
struct RoleTarget {
    #[serde(default, rename = "targetRoleId", alias = "target_role_id")]
    target_role_id: Option<String>,
    #[serde(default, rename = "subPrompt", alias = "sub_prompt")]
    sub_prompt: Option<String>,
}

async fn orchestrate_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<DispatchReceipt>> {
    let target: RoleTarget = optional_body(&body)?;
    let tenant = requester_tenant(&headers);
    let receipt = state
        .orchestrate(&id, tenant.as_deref(), target.target_role_id.as_deref())
        .await?;
    Ok(Json(receipt))
}

async fn dispatch_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<DispatchReceipt>> {
    let target: RoleTarget = optional_body(&body)?;
    let tenant = requester_tenant(&headers);
    let receipt = state
        .dispatch(
            &id,
            tenant.as_deref(),
            target.target_role_id.as_deref(),
            target.sub_prompt,
        )
        .await?;
    Ok(Json(receipt))
}

async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<DispatchReceipt>> {
    let tenant = requester_tenant(&headers);
    Ok(Json(state.retry(&id, tenant.as_deref()).await?))
}

#[derive(Debug, Deserialize)]
struct CircuitResetInput {
    operator: String,
    #[serde(default)]
    extra_interrupts: Option<u32>,
}

async fn reset_circuit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(input): Json<CircuitResetInput>,
) -> ApiResult<Json<Task>> {
    let tenant = requester_tenant(&headers);
    task_for(&state, &id, tenant.as_deref()).await?;
    let task = state
        .reset_circuit(&id, &input.operator, input.extra_interrupts)
        .await?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize, Default)]
struct ApproveInput {
    #[serde(default)]
    approver: String,
}

async fn approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Approval>> {
    let input: ApproveInput = optional_body(&body)?;
    let tenant = requester_tenant(&headers);
    Ok(Json(
        state
            .approve(&id, &input.approver, tenant.as_deref())
            .await?,
    ))
}

#[derive(Debug, Deserialize, Default)]
struct RejectInput {
    #[serde(default)]
    note: String,
    #[serde(default)]
    reviewer: String,
}

async fn reject(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<DispatchReceipt>> {
    let input: RejectInput = optional_body(&body)?;
    let tenant = requester_tenant(&headers);
    let receipt = state
        .reject(&id, &input.note, &input.reviewer, tenant.as_deref())
        .await?;
    Ok(Json(receipt))
}

async fn submit_insight(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<NewInsight>,
) -> ApiResult<Json<Value>> {
    let tenant = requester_tenant(&headers);
    task_for(&state, &input.parent_task_id, tenant.as_deref()).await?;
    let insight = state.submit_insight(input).await?;
    Ok(Json(json!({
        "success": true,
        "insight_id": insight.id,
    })))
}

async fn submit_review(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<NewReview>,
) -> ApiResult<Json<Review>> {
    let tenant = requester_tenant(&headers);
    task_for(&state, &input.task_id, tenant.as_deref()).await?;
    Ok(Json(state.submit_review(input).await?))
}

#[derive(Debug, Deserialize)]
struct ClassifyInput {
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    origin: TaskOrigin,
}

async fn classify_tool(
    State(state): State<AppState>,
    Json(input): Json<ClassifyInput>,
) -> ApiResult<Json<PolicyDryRun>> {
    if input.tool.trim().is_empty() {
        return Err(ApiError::bad_request("tool must not be empty"));
    }
    let args = if input.args.is_null() {
        json!({})
    } else {
        input.args
    };
    Ok(Json(
        state.classify_tool(input.tool.trim(), &args, input.origin).await,
    ))
}

async fn observability_summary(State(state): State<AppState>) -> ApiResult<Json<TraceSummary>> {
    Ok(Json(state.trace_summary().await?))
}

async fn telegram_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<Value>,
) -> ApiResult<Json<Value>> {
    let Some(message) = parse_telegram_update(&update) else {
        tracing::debug!("telegram update without text ignored");
        return Ok(Json(json!({"ok": true, "ignored": true})));
    };
    let workflow = state.config().get().await.workflow;
    let tenant = requester_tenant(&headers).unwrap_or(workflow.default_tenant);
    tracing::info!(
        update_id = message.update_id,
        sender = %message.sender,
        "telegram message accepted"
    );
    let task = state
        .create_task(
            message.into_new_task(&tenant),
            workflow.auto_orchestrate_inbound,
        )
        .await?;
    Ok(Json(json!({"ok": true, "task_id": task.id})))
}

async fn purge_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<PurgeSummary>> {
    let tenant = requester_tenant(&headers);
    task_for(&state, &id, tenant.as_deref()).await?;
    Ok(Json(state.purge_task(&id).await?))
}

async fn sweep(State(state): State<AppState>) -> ApiResult<Json<MaintenanceReport>> {
    Ok(Json(state.run_maintenance().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use mctl_core::test_support::{test_mission_control, TestHarness};
    use tower::ServiceExt;

    async fn test_app(overrides: Value) -> (TestHarness, Router) {
        let harness = test_mission_control(overrides).await.expect("harness");
        let app = app_router(AppState::new(harness.mc.clone()));
        (harness, app)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        tenant: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(tenant) = tenant {
            req = req.header(TENANT_HEADER, tenant);
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => req.body(Body::empty()),
        }
        .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, payload)
    }

    async fn create(app: &Router, title: &str, tenant: &str) -> String {
        let (status, payload) = call(
            app,
            "POST",
            "/tasks",
            None,
            Some(json!({"title": title, "objective": format!("objective for {title}"), "tenant_id": tenant})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{payload}");
        payload["task_id"].as_str().expect("task id").to_string()
    }

    #[tokio::test]
    async fn global_health_route_returns_healthy_shape() {
        let (_h, app) = test_app(json!({})).await;
        let (status, payload) = call(&app, "GET", "/global/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.get("healthy").and_then(|v| v.as_bool()), Some(true));
        assert_eq!(payload.get("ready").and_then(|v| v.as_bool()), Some(true));
        assert!(payload.get("version").and_then(|v| v.as_str()).is_some());
    }

    #[tokio::test]
    async fn created_task_is_only_visible_to_its_tenant() {
        let (_h, app) = test_app(json!({})).await;
        let id = create(&app, "Competitor scan", "acme").await;

        let (status, payload) = call(&app, "GET", &format!("/tasks/{id}"), Some("acme"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["task"]["status"], "intake");
        assert_eq!(payload["task"]["tenant_id"], "acme");
        assert!(payload["runs"].as_array().expect("runs").is_empty());

        let (status, payload) =
            call(&app, "GET", &format!("/tasks/{id}"), Some("globex"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(payload["error"]["code"], "NOT_FOUND");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/tasks/{id}/orchestrate"),
            Some("globex"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_intake_uses_the_error_envelope() {
        let (_h, app) = test_app(json!({})).await;
        let (status, payload) = call(
            &app,
            "POST",
            "/tasks",
            None,
            Some(json!({"title": "   ", "tenant_id": "acme"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["error"]["code"], "INVALID_INPUT");

        let (status, _) = call(
            &app,
            "POST",
            "/tasks",
            Some("globex"),
            Some(json!({"title": "Mismatch", "tenant_id": "acme"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn orchestrate_review_and_approve_over_http() {
        let (h, app) = test_app(json!({})).await;
        let id = create(&app, "Quarterly summary", "acme").await;

        let (status, receipt) =
            call(&app, "POST", &format!("/tasks/{id}/orchestrate"), None, None).await;
        assert_eq!(status, StatusCode::OK, "{receipt}");
        assert!(receipt["run_id"].as_str().is_some());
        assert!(receipt["owner_role_id"].as_str().is_some());
        h.mc.settle().await;

        let (_, detail) = call(&app, "GET", &format!("/tasks/{id}"), None, None).await;
        assert_eq!(detail["task"]["status"], "hitl_review");
        let approval_id = detail["approvals"][0]["id"]
            .as_str()
            .expect("approval")
            .to_string();

        let (status, payload) = call(
            &app,
            "POST",
            &format!("/approvals/{approval_id}/reject"),
            None,
            Some(json!({"note": "  ", "reviewer": "carol"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["error"]["code"], "INVALID_INPUT");

        let (status, approval) = call(
            &app,
            "POST",
            &format!("/approvals/{approval_id}/approve"),
            None,
            Some(json!({"approver": "alice"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{approval}");
        assert_eq!(approval["status"], "approved");
        h.mc.settle().await;

        let (_, detail) = call(&app, "GET", &format!("/tasks/{id}"), None, None).await;
        assert_eq!(detail["task"]["status"], "completed");

        let (status, payload) = call(
            &app,
            "POST",
            &format!("/approvals/{approval_id}/approve"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(payload["error"]["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn approvals_are_hidden_from_other_tenants() {
        let (h, app) = test_app(json!({})).await;
        let id = create(&app, "Vendor review", "acme").await;
        let (status, _) = call(
            &app,
            "POST",
            &format!("/tasks/{id}/orchestrate"),
            Some("acme"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        h.mc.settle().await;

        let (_, detail) = call(&app, "GET", &format!("/tasks/{id}"), Some("acme"), None).await;
        let approval_id = detail["approvals"][0]["id"]
            .as_str()
            .expect("approval")
            .to_string();

        let (status, payload) = call(
            &app,
            "POST",
            &format!("/approvals/{approval_id}/approve"),
            Some("globex"),
            Some(json!({"approver": "mallory"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(payload["error"]["code"], "NOT_FOUND");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/approvals/{approval_id}/reject"),
            Some("globex"),
            Some(json!({"note": "redo it", "reviewer": "mallory"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, detail) = call(&app, "GET", &format!("/tasks/{id}"), Some("acme"), None).await;
        assert_eq!(detail["task"]["status"], "hitl_review");
        assert_eq!(detail["approvals"][0]["status"], "pending");

        let (status, approval) = call(
            &app,
            "POST",
            &format!("/approvals/{approval_id}/approve"),
            Some("acme"),
            Some(json!({"approver": "alice"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{approval}");
        assert_eq!(approval["decided_by"], "alice");
    }

    #[tokio::test]
    async fn retry_is_refused_for_tasks_that_have_not_failed() {
        let (_h, app) = test_app(json!({})).await;
        let id = create(&app, "Pricing audit", "acme").await;
        let (status, payload) = call(&app, "POST", &format!("/tasks/{id}/retry"), None, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(payload["error"]["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn insight_submission_answers_immediately() {
        let (_h, app) = test_app(json!({})).await;
        let id = create(&app, "Market sizing", "acme").await;
        let (status, payload) = call(
            &app,
            "POST",
            "/insights",
            None,
            Some(json!({
                "parent_task_id": id,
                "status": "open",
                "claim": "TAM source is outdated",
                "severity": "S1",
                "evidence_refs": ["doc://tam"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{payload}");
        assert_eq!(payload["success"], true);
        assert!(payload["insight_id"]
            .as_str()
            .is_some_and(|id| id.starts_with("ins_")));

        let (status, _) = call(
            &app,
            "POST",
            "/insights",
            Some("globex"),
            Some(json!({"parent_task_id": id, "claim": "leak", "severity": "S3"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn block_review_moves_task_to_blocked() {
        let (h, app) = test_app(json!({})).await;
        let id = create(&app, "Launch checklist", "acme").await;
        let (status, review) = call(
            &app,
            "POST",
            "/reviews",
            None,
            Some(json!({"task_id": id, "verdict": "BLOCK", "summary": "legal sign-off missing"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{review}");
        assert_eq!(review["verdict"], "BLOCK");
        h.mc.settle().await;

        let (_, detail) = call(&app, "GET", &format!("/tasks/{id}"), None, None).await;
        assert_eq!(detail["task"]["status"], "blocked");
        assert!(!h.notifier.sent().await.is_empty());
    }

    #[tokio::test]
    async fn policy_dry_run_reports_decisions() {
        let (_h, app) = test_app(json!({})).await;
        let (status, payload) = call(
            &app,
            "POST",
            "/policy/classify",
            None,
            Some(json!({"tool": "shell", "args": {"command": "rm -rf /"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["decision"], "banned");

        let (_, payload) = call(
            &app,
            "POST",
            "/policy/classify",
            None,
            Some(json!({"tool": "read_task", "args": {"task_id": "t1"}})),
        )
        .await;
        assert_eq!(payload["decision"], "auto_approve");
        assert_eq!(payload["untrusted"], false);

        let (_, payload) = call(
            &app,
            "POST",
            "/policy/classify",
            None,
            Some(json!({
                "tool": "read_task",
                "args": {"task_id": "t1"},
                "origin": {"channel": "telegram", "sender_id": "999"}
            })),
        )
        .await;
        assert_eq!(payload["decision"], "hitl_required");
        assert_eq!(payload["untrusted"], true);
    }

    #[tokio::test]
    async fn telegram_webhook_creates_an_inbound_task() {
        let (_h, app) = test_app(json!({"workflow": {"auto_orchestrate_inbound": false}})).await;
        let (status, payload) = call(
            &app,
            "POST",
            "/webhooks/telegram",
            None,
            Some(json!({
                "update_id": 11,
                "message": {
                    "text": "Summarize yesterday's incidents",
                    "from": {"id": 42, "username": "oncall"},
                    "chat": {"id": 4242}
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{payload}");
        let id = payload["task_id"].as_str().expect("task id").to_string();

        let (_, detail) = call(&app, "GET", &format!("/tasks/{id}"), None, None).await;
        assert_eq!(detail["task"]["origin"]["channel"], "telegram");
        assert_eq!(detail["task"]["origin"]["sender_id"], "42");
        assert_eq!(detail["task"]["origin"]["chat_id"], "4242");
        assert_eq!(detail["task"]["tenant_id"], "default");
        assert_eq!(detail["task"]["status"], "intake");

        let (status, payload) = call(
            &app,
            "POST",
            "/webhooks/telegram",
            None,
            Some(json!({"update_id": 12, "my_chat_member": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["ignored"], true);
    }

    #[tokio::test]
    async fn observability_summary_starts_empty() {
        let (_h, app) = test_app(json!({})).await;
        let (status, payload) = call(&app, "GET", "/observability/summary", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["total_spans"], 0);
        assert!(payload.get("coverage").is_some());
    }

    #[tokio::test]
    async fn purge_removes_the_task_and_sweep_reports() {
        let (_h, app) = test_app(json!({})).await;
        let id = create(&app, "Scratch", "acme").await;

        let (status, payload) =
            call(&app, "DELETE", &format!("/admin/tasks/{id}"), None, None).await;
        assert_eq!(status, StatusCode::OK, "{payload}");
        assert_eq!(payload["task_id"], id.as_str());

        let (status, _) = call(&app, "GET", &format!("/tasks/{id}"), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, report) =
            call(&app, "POST", "/admin/maintenance/sweep", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(report["zombie_tasks"].as_array().expect("list").is_empty());
    }

    #[test]
    fn event_filter_matches_task_and_parent_ids() {
        let filter = EventFilterQuery {
            task_id: Some("t1".into()),
        };
        assert!(event_matches_filter(
            &EngineEvent::new("task.created", json!({"taskID": "t1"})),
            &filter
        ));
        assert!(event_matches_filter(
            &EngineEvent::new("synthesis.created", json!({"parentTaskID": "t1", "taskID": "t9"})),
            &filter
        ));
        assert!(!event_matches_filter(
            &EngineEvent::new("task.created", json!({"taskID": "t2"})),
            &filter
        ));
        assert!(event_matches_filter(
            &EngineEvent::new("task.created", json!({})),
            &EventFilterQuery::default()
        ));
    }
}
