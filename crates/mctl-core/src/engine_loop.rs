use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::{timeout_at, Instant};
use tracing::Level;

use mctl_observability::{
    emit_event, estimate_tokens, ObservabilityEvent, ProcessKind, SpanRecord, Tracer,
};
use mctl_types::{
    Approval, Role, RunStatus, Span, SpanKind, Task, TaskStatus, TokenSource,
    GATE_EXECUTION_COMPLETED,
};

use crate::intent::classify_intent;
use crate::policy::{normalize_action, PolicyConfig};
use crate::prompt::{compose_prompt, strip_handoff_fragment, PromptInput};
use crate::{
    classify, load_policy, render_error_report, role_can_use_tool, tenant, ArtifactStore,
    ConfigStore, EventBus, ExecutionError, LlmPeer, PeerEvent, PeerRequest, PolicyContext,
    PolicyDecision, RoleRegistry, SideEffect, SideEffectQueue, Storage, TokenUsage, ToolContext,
    ToolOutput, ToolRegistry,
};

/// Everything the loop needs to drive one run. Built by dispatch.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task_id: String,
    pub run_id: String,
    pub role_id: String,
    pub session_key: String,
    pub task_title: String,
    pub objective: String,
    pub sub_prompt: Option<String>,
    pub revision_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { summary: String },
    /// Policy asked for a human; the run is parked, not failed.
    Escalated { approval_id: String, reason: String },
    Failed { code: String, message: String },
}

enum LoopExit {
    Final { text: String },
    Gate { tool: String, reason: String },
}

enum ToolStep {
    Executed(ToolOutput),
    Gate { reason: String },
}

#[derive(Default)]
struct Accounting {
    text: String,
    usage: Option<TokenUsage>,
    model: Option<String>,
    tool_calls: usize,
}

struct RunScope<'a> {
    req: &'a RunRequest,
    task: &'a Task,
    role: &'a Role,
    requester_tenant: &'a str,
    policy_ctx: PolicyContext,
    policy_path: PathBuf,
    deadline: Instant,
    budget: Duration,
}

#[derive(Clone)]
pub struct EngineLoop {
    storage: Arc<Storage>,
    event_bus: EventBus,
    roles: RoleRegistry,
    tools: ToolRegistry,
    peer: Arc<dyn LlmPeer>,
    tracer: Arc<Tracer>,
    artifacts: ArtifactStore,
    side_effects: SideEffectQueue,
    config: ConfigStore,
    state_dir: PathBuf,
}

impl EngineLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        event_bus: EventBus,
        roles: RoleRegistry,
        tools: ToolRegistry,
        peer: Arc<dyn LlmPeer>,
        tracer: Arc<Tracer>,
        artifacts: ArtifactStore,
        side_effects: SideEffectQueue,
        config: ConfigStore,
        state_dir: &Path,
    ) -> Self {
        Self {
            storage,
            event_bus,
            roles,
            tools,
            peer,
            tracer,
            artifacts,
            side_effects,
            config,
            state_dir: state_dir.to_path_buf(),
        }
    }

    /// Drives one run to completion, a policy gate, or a recorded failure. Never returns an
    /// error: every failure is converted into run/task state plus an error report.
    pub async fn run(&self, req: RunRequest) -> RunOutcome {
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("engine.loop", "run.start")
                .task(&req.task_id)
                .run(&req.run_id)
                .role(&req.role_id)
                .status("running"),
        );
        self.event_bus.emit(
            "run.started",
            json!({"taskID": req.task_id, "runID": req.run_id, "roleID": req.role_id}),
        );

        let outcome = match self.drive(&req).await {
            Ok(LoopExit::Final { text }) => self.finish_success(&req, &text).await,
            Ok(LoopExit::Gate { tool, reason }) => self.finish_gate(&req, &tool, &reason).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(outcome) => outcome,
            Err(err) => self.finish_failure(&req, err).await,
        }
    }

    async fn drive(&self, req: &RunRequest) -> Result<LoopExit, ExecutionError> {
        let cfg = self.config.get().await;
        let budget = Duration::from_secs(cfg.execution.timeout_secs.max(1));
        let deadline = Instant::now() + budget;

        let task = self
            .storage
            .get_task(&req.task_id)
            .await
            .ok_or_else(|| ExecutionError::MissingRecord {
                kind: "task",
                id: req.task_id.clone(),
            })?;
        let run = self
            .storage
            .get_run(&req.run_id)
            .await
            .ok_or_else(|| ExecutionError::MissingRecord {
                kind: "run",
                id: req.run_id.clone(),
            })?;
        let role = self.roles.get_or_default(Some(&req.role_id)).await;

        let intent = classify_intent(&req.task_title, &req.objective);
        let matched = intent.matched.join(",");
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("engine.loop", "intent.classified")
                .task(&req.task_id)
                .run(&req.run_id)
                .status(intent.domain)
                .detail(&matched),
        );

        let tools = self
            .tools
            .list()
            .await
            .into_iter()
            .filter(|schema| role_can_use_tool(&role, &schema.name))
            .collect::<Vec<_>>();
        let prompt = compose_prompt(PromptInput {
            role: &role,
            task: &task,
            intent: &intent,
            sub_prompt: req.sub_prompt.as_deref(),
            revision_note: req.revision_note.as_deref(),
            tools: &tools,
        });
        let run_id = req.run_id.clone();
        let stored_prompt = prompt.clone();
        self.storage
            .transact(move |state| {
                state.run_mut(&run_id)?.prompt = Some(stored_prompt);
                Ok(())
            })
            .await?;

        let scope = RunScope {
            req,
            task: &task,
            role: &role,
            requester_tenant: &run.requester_tenant,
            policy_ctx: PolicyContext::new(task.origin.clone(), cfg.policy.trusted_identities.clone()),
            policy_path: cfg.policy_path(&self.state_dir),
            deadline,
            budget,
        };

        let llm_span = SpanRecord::start(SpanKind::LlmCall, &req.task_id, &req.run_id)
            .name("llm.session")
            .role(&role.id);
        let mut acct = Accounting::default();
        let request = PeerRequest {
            session_key: req.session_key.clone(),
            role_id: role.id.clone(),
            prompt: prompt.clone(),
            tools,
            model: cfg.peer.model.clone(),
        };
        let result = self
            .converse(&scope, request, cfg.execution.max_tool_calls, &mut acct)
            .await;
        self.record_llm_span(llm_span, &prompt, &acct, result.is_ok())
            .await;
        result
    }

    async fn converse(
        &self,
        scope: &RunScope<'_>,
        request: PeerRequest,
        max_tool_calls: usize,
        acct: &mut Accounting,
    ) -> Result<LoopExit, ExecutionError> {
        let session = match timeout_at(scope.deadline, self.peer.send(request)).await {
            Err(_) => return Err(ExecutionError::Timeout(scope.budget)),
            Ok(Err(err)) => return Err(ExecutionError::PeerLifecycle(format!("{err:#}"))),
            Ok(Ok(session)) => session,
        };
        acct.model = session.model.clone();
        let stream_id = session.stream_id.clone();
        let run_id = scope.req.run_id.clone();
        let stored_stream = stream_id.clone();
        self.storage
            .transact(move |state| {
                state.run_mut(&run_id)?.stream_id = Some(stored_stream);
                Ok(())
            })
            .await?;

        let mut events = session.events;
        // Dedup lives exactly as long as this run.
        let mut seen_calls = HashSet::new();
        let mut pending: VecDeque<(String, String, Value)> = VecDeque::new();
        let mut final_seen = false;

        loop {
            while let Some((call_id, name, args)) = pending.pop_front() {
                acct.tool_calls += 1;
                if acct.tool_calls > max_tool_calls {
                    return Err(ExecutionError::ToolLoopLimit {
                        limit: max_tool_calls,
                    });
                }
                match self.handle_tool_call(scope, &call_id, &name, args).await? {
                    ToolStep::Gate { reason } => {
                        return Ok(LoopExit::Gate { tool: name, reason });
                    }
                    ToolStep::Executed(output) => {
                        let submit = self.peer.submit_tool_result(&stream_id, &call_id, &output);
                        match timeout_at(scope.deadline, submit).await {
                            Err(_) => return Err(ExecutionError::Timeout(scope.budget)),
                            Ok(Err(err)) => {
                                return Err(ExecutionError::PeerLifecycle(format!("{err:#}")))
                            }
                            Ok(Ok(())) => {}
                        }
                    }
                }
            }

            if final_seen {
                return Ok(LoopExit::Final {
                    text: acct.text.clone(),
                });
            }

            let next = match timeout_at(scope.deadline, events.next()).await {
                Err(_) => return Err(ExecutionError::Timeout(scope.budget)),
                Ok(next) => next,
            };
            match next {
                None if !acct.text.trim().is_empty() => {
                    tracing::debug!(run_id = %scope.req.run_id, "peer stream closed without final event");
                    return Ok(LoopExit::Final {
                        text: acct.text.clone(),
                    });
                }
                None => {
                    return Err(ExecutionError::PeerLifecycle(
                        "stream ended without a final response".to_string(),
                    ));
                }
                Some(Err(err)) => return Err(ExecutionError::PeerLifecycle(format!("{err:#}"))),
                Some(Ok(event)) => match event {
                    PeerEvent::TextDelta { text } => acct.text.push_str(&text),
                    PeerEvent::ToolCall {
                        id,
                        name,
                        arguments,
                    } => {
                        if seen_calls.insert(id.clone()) {
                            pending.push_back((id, normalize_action(&name), arguments));
                        } else {
                            tracing::debug!(call_id = %id, "duplicate tool call ignored");
                        }
                    }
                    PeerEvent::Usage { usage } => acct.usage = Some(usage),
                    PeerEvent::Final { text, usage } => {
                        if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
                            acct.text = text;
                        }
                        if usage.is_some() {
                            acct.usage = usage;
                        }
                        final_seen = true;
                    }
                    PeerEvent::Error { message, code } => {
                        let detail = match code {
                            Some(code) => format!("{code}: {message}"),
                            None => message,
                        };
                        return Err(ExecutionError::PeerLifecycle(detail));
                    }
                },
            }
        }
    }

    async fn handle_tool_call(
        &self,
        scope: &RunScope<'_>,
        call_id: &str,
        name: &str,
        args: Value,
    ) -> Result<ToolStep, ExecutionError> {
        let req = scope.req;
        let span = SpanRecord::start(SpanKind::ToolCall, &req.task_id, &req.run_id)
            .name(name)
            .role(&scope.role.id)
            .tool(name, &args)
            .meta("call_id", json!(call_id));

        let owner_tenant = match tenant::targeted_task_id(&args) {
            Some(target) => self
                .storage
                .get_task(target)
                .await
                .map(|t| t.tenant_id)
                .unwrap_or_else(|| scope.task.tenant_id.clone()),
            None => scope.task.tenant_id.clone(),
        };
        if let Err(err) = tenant::enforce(scope.requester_tenant, &owner_tenant) {
            self.record_span(span.meta("blocked_by", json!("tenant")).finish(false))
                .await;
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent::new("engine.loop", "tool.tenant_blocked")
                    .task(&req.task_id)
                    .run(&req.run_id)
                    .tool(name)
                    .error_code(err.code()),
            );
            return Err(err);
        }

        let (policy, source) = load_policy(&scope.policy_path).await;
        let verdict = classify(name, &args, &scope.policy_ctx, &policy);
        let PolicyConfig {
            allowed_fetch_domains,
            ..
        } = policy;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("policy", "policy.decision")
                .task(&req.task_id)
                .run(&req.run_id)
                .tool(name)
                .status(verdict.decision.as_str())
                .detail(&verdict.reason),
        );
        let span = span
            .meta("decision", json!(verdict.decision.as_str()))
            .meta("policy_source", json!(format!("{source:?}")));

        match verdict.decision {
            PolicyDecision::Banned => {
                self.record_span(span.finish(false)).await;
                Err(ExecutionError::PolicyBlocked {
                    tool: name.to_string(),
                    reason: verdict.reason,
                })
            }
            PolicyDecision::HitlRequired => Ok(ToolStep::Gate {
                reason: verdict.reason,
            }),
            PolicyDecision::AutoApprove => {
                let output = if !role_can_use_tool(scope.role, name) {
                    ToolOutput::error(format!(
                        "role `{}` is not allowed to use `{name}`",
                        scope.role.id
                    ))
                } else {
                    let ctx = ToolContext {
                        task_id: req.task_id.clone(),
                        run_id: req.run_id.clone(),
                        tenant_id: scope.requester_tenant.to_string(),
                        allowed_fetch_domains,
                    };
                    match timeout_at(scope.deadline, self.tools.execute(name, &ctx, args)).await {
                        Err(_) => {
                            self.record_span(span.meta("timeout", json!(true)).finish(false))
                                .await;
                            return Err(ExecutionError::Timeout(scope.budget));
                        }
                        Ok(Ok(output)) => output,
                        Ok(Err(err)) => ToolOutput::error(format!("tool `{name}` failed: {err:#}")),
                    }
                };
                self.record_span(span.finish(!output.is_error)).await;
                Ok(ToolStep::Executed(output))
            }
        }
    }

    async fn finish_success(
        &self,
        req: &RunRequest,
        text: &str,
    ) -> Result<RunOutcome, ExecutionError> {
        let summary = strip_handoff_fragment(text);
        let now = Utc::now();
        let task_id = req.task_id.clone();
        let run_id = req.run_id.clone();
        let stored_summary = summary.clone();
        let (is_master, approval_id, status) = self
            .storage
            .transact(move |state| {
                let run = state.run_mut(&run_id)?;
                run.status = RunStatus::Completed;
                run.ended_at = Some(now);
                run.output_summary = Some(stored_summary);

                let is_master = state.task(&task_id)?.is_master();
                if is_master {
                    state.try_transition(&task_id, TaskStatus::Completed, now)?;
                    let status = state.task(&task_id)?.status;
                    return Ok((true, None, status));
                }
                if !state.try_transition(&task_id, TaskStatus::HitlReview, now)? {
                    let status = state.task(&task_id)?.status;
                    return Ok((false, None, status));
                }
                let approval_id = match state.pending_approval_for(&task_id) {
                    Some(existing) => existing.id.clone(),
                    None => {
                        let approval = Approval::pending(
                            &task_id,
                            Some(run_id.clone()),
                            GATE_EXECUTION_COMPLETED,
                            now,
                        );
                        let id = approval.id.clone();
                        state.approvals.insert(id.clone(), approval);
                        id
                    }
                };
                Ok((false, Some(approval_id), TaskStatus::HitlReview))
            })
            .await?;

        self.record_span(
            SpanRecord::start(SpanKind::Synthesis, &req.task_id, &req.run_id)
                .name("run.completed")
                .role(&req.role_id)
                .meta("summary_chars", json!(summary.chars().count()))
                .meta("master", json!(is_master))
                .meta("task_status", json!(status.as_str()))
                .finish(true),
        )
        .await;

        if is_master && status == TaskStatus::Completed {
            self.side_effects.enqueue(SideEffect::Deliver {
                task_id: req.task_id.clone(),
            });
            self.side_effects.enqueue(SideEffect::FanIn {
                task_id: req.task_id.clone(),
            });
        }
        if let Some(approval_id) = &approval_id {
            self.event_bus.emit(
                "approval.requested",
                json!({
                    "taskID": req.task_id,
                    "approvalID": approval_id,
                    "reason": GATE_EXECUTION_COMPLETED,
                }),
            );
        }
        self.event_bus.emit(
            "run.completed",
            json!({"taskID": req.task_id, "runID": req.run_id, "taskStatus": status}),
        );
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("engine.loop", "run.completed")
                .task(&req.task_id)
                .run(&req.run_id)
                .role(&req.role_id)
                .status(status.as_str()),
        );
        Ok(RunOutcome::Completed { summary })
    }

    async fn finish_gate(
        &self,
        req: &RunRequest,
        tool: &str,
        reason: &str,
    ) -> Result<RunOutcome, ExecutionError> {
        let gate_reason = Approval::policy_reason(reason);
        let now = Utc::now();
        let task_id = req.task_id.clone();
        let run_id = req.run_id.clone();
        let stored_reason = gate_reason.clone();
        let approval_id = self
            .storage
            .transact(move |state| {
                state.run_mut(&run_id)?.status = RunStatus::HitlReview;
                state.transition(&task_id, TaskStatus::HitlReview, now)?;
                if let Some(existing) = state.pending_approval_for(&task_id) {
                    return Ok(existing.id.clone());
                }
                let approval = Approval::pending(&task_id, Some(run_id.clone()), stored_reason, now);
                let id = approval.id.clone();
                state.approvals.insert(id.clone(), approval);
                Ok(id)
            })
            .await?;

        self.record_span(
            SpanRecord::start(SpanKind::HitlGate, &req.task_id, &req.run_id)
                .name("policy.gate")
                .role(&req.role_id)
                .meta("tool", json!(tool))
                .meta("reason", json!(gate_reason))
                .meta("approval_id", json!(approval_id))
                .finish(true),
        )
        .await;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("engine.loop", "run.escalated")
                .task(&req.task_id)
                .run(&req.run_id)
                .tool(tool)
                .status("hitl_review")
                .detail(&gate_reason),
        );
        self.event_bus.emit(
            "approval.requested",
            json!({"taskID": req.task_id, "approvalID": approval_id, "reason": gate_reason}),
        );
        Ok(RunOutcome::Escalated {
            approval_id,
            reason: gate_reason,
        })
    }

    async fn finish_failure(&self, req: &RunRequest, err: ExecutionError) -> RunOutcome {
        let code = err.code();
        let message = err.to_string();
        let now = Utc::now();

        let task = self.storage.get_task(&req.task_id).await;
        let report = match &task {
            Some(task) => render_error_report(task, &req.run_id, code, &message, now),
            None => format!("# Run failed\n\n`{code}`: {message}\n"),
        };
        if let Err(write_err) = self
            .artifacts
            .write_error_report(&req.task_id, &req.run_id, &report)
            .await
        {
            tracing::warn!(run_id = %req.run_id, "failed to write error report: {write_err:#}");
        }

        let task_id = req.task_id.clone();
        let run_id = req.run_id.clone();
        let stored_message = message.clone();
        let result = self
            .storage
            .transact(move |state| {
                if let Ok(run) = state.run_mut(&run_id) {
                    run.status = RunStatus::Failed;
                    run.ended_at = Some(now);
                    run.error_message = Some(stored_message);
                    run.output_summary = Some(report);
                }
                let current = state.task(&task_id)?.status;
                if current == TaskStatus::HitlReview {
                    return Ok((current, true));
                }
                state.try_transition(&task_id, TaskStatus::Failed, now)?;
                Ok((state.task(&task_id)?.status, false))
            })
            .await;

        let (status, preserved) = match result {
            Ok(pair) => pair,
            Err(store_err) => {
                tracing::error!(run_id = %req.run_id, "failed to record run failure: {store_err}");
                (TaskStatus::Failed, false)
            }
        };
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent::new("engine.loop", "run.failed")
                .task(&req.task_id)
                .run(&req.run_id)
                .role(&req.role_id)
                .status(status.as_str())
                .error_code(code)
                .detail(&truncate_text(&message, 500)),
        );
        self.event_bus.emit(
            "run.failed",
            json!({
                "taskID": req.task_id,
                "runID": req.run_id,
                "code": code,
                "message": message,
                "hitlPreserved": preserved,
            }),
        );
        RunOutcome::Failed {
            code: code.to_string(),
            message,
        }
    }

    async fn record_llm_span(
        &self,
        record: SpanRecord,
        prompt: &str,
        acct: &Accounting,
        success: bool,
    ) {
        let (tokens, source) = match acct.usage.map(|u| u.total()).filter(|t| *t > 0) {
            Some(total) => (total, TokenSource::Exact),
            None => (
                estimate_tokens(&format!("{prompt}{}", acct.text)),
                TokenSource::Estimated,
            ),
        };
        let mut record = record
            .tokens(tokens, source)
            .meta("tool_calls", json!(acct.tool_calls));
        if let Some(model) = &acct.model {
            record = record.model(model.clone());
        }
        self.record_span(record.finish(success)).await;
    }

    async fn record_span(&self, span: Span) {
        if let Err(err) = self.tracer.record(&span).await {
            tracing::warn!(span_id = %span.span_id, "failed to append span: {err:#}");
        }
    }
}

fn truncate_text(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out = input.chars().take(max_chars).collect::<String>();
    out.push_str("...<truncated>");
    out
}
