use std::sync::Arc;

use serde_json::json;
use tokio::sync::Notify;

use mctl_core::test_support::{test_mission_control, tool_call, ScriptedSession, TestHarness};
use mctl_core::{FanInOutcome, MissionError, PeerEvent, PolicyDecision, ReplanOutcome, Urgency};
use mctl_types::{
    ApprovalStatus, HandoffKind, NewInsight, NewReview, NewTask, OriginChannel, RunStatus,
    Severity, SpanKind, Task, TaskKind, TaskOrigin, TaskStatus, TokenSource, Verdict,
    GATE_EXECUTION_COMPLETED,
};

async fn harness() -> TestHarness {
    harness_with(json!({})).await
}

async fn harness_with(overrides: serde_json::Value) -> TestHarness {
    test_mission_control(overrides).await.expect("harness")
}

async fn create(h: &TestHarness, title: &str, tenant: &str, parent: Option<&str>) -> Task {
    let mut input = NewTask::new(title, format!("objective for {title}"), tenant);
    input.parent_id = parent.map(str::to_string);
    h.mc.create_task(input, false).await.expect("create task")
}

async fn task(h: &TestHarness, id: &str) -> Task {
    h.mc.storage().get_task(id).await.expect("task exists")
}

async fn force_status(h: &TestHarness, id: &str, status: TaskStatus) {
    let id = id.to_string();
    h.mc.storage()
        .transact(move |state| {
            state.task_mut(&id)?.status = status;
            Ok(())
        })
        .await
        .expect("force status");
}

/// Runs a task through a plain reply and returns the pending approval id.
async fn run_to_review(h: &TestHarness, task_id: &str) -> String {
    h.mc.orchestrate(task_id, None, None).await.expect("orchestrate");
    h.mc.settle().await;
    let approvals = h.mc.storage().approvals_for_task(task_id).await;
    approvals
        .into_iter()
        .find(|a| a.status == ApprovalStatus::Pending)
        .expect("pending approval")
        .id
}

#[tokio::test]
async fn orchestrated_run_parks_for_human_review() {
    let h = harness().await;
    let t = create(&h, "Quarterly summary", "acme", None).await;
    let release = Arc::new(Notify::new());
    h.peer
        .push(ScriptedSession::held_reply(release.clone(), "All figures reconciled."))
        .await;

    let receipt = h.mc.orchestrate(&t.id, None, None).await.expect("orchestrate");
    assert_eq!(receipt.status, TaskStatus::InExecution);
    let runs = h.mc.storage().runs_for_task(&t.id).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Running);
    assert_eq!(runs[0].id, receipt.run_id);

    release.notify_one();
    h.mc.settle().await;

    let runs = h.mc.storage().runs_for_task(&t.id).await;
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(
        runs[0].output_summary.as_deref(),
        Some("All figures reconciled.")
    );
    assert_eq!(task(&h, &t.id).await.status, TaskStatus::HitlReview);
    let approvals = h.mc.storage().approvals_for_task(&t.id).await;
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].status, ApprovalStatus::Pending);
    assert_eq!(approvals[0].gate_reason, GATE_EXECUTION_COMPLETED);
}

#[tokio::test]
async fn orchestrating_twice_reuses_the_running_run() {
    let h = harness().await;
    let t = create(&h, "Draft newsletter", "acme", None).await;
    let release = Arc::new(Notify::new());
    h.peer
        .push(ScriptedSession::held_reply(release.clone(), "Draft ready."))
        .await;
    let first = h.mc.orchestrate(&t.id, None, None).await.expect("first");
    let second = h.mc.orchestrate(&t.id, None, None).await.expect("second");
    assert_eq!(first.run_id, second.run_id);
    assert_eq!(first.owner_role_id, "writer");
    release.notify_one();
    h.mc.settle().await;
    assert_eq!(h.mc.storage().runs_for_task(&t.id).await.len(), 1);
}

#[tokio::test]
async fn approval_completes_task_and_archives_deliverable() {
    let h = harness().await;
    let t = create(&h, "Vendor comparison", "acme", None).await;
    let approval_id = run_to_review(&h, &t.id).await;

    let approval = h.mc.approve(&approval_id, "alice", None).await.expect("approve");
    h.mc.settle().await;

    assert_eq!(approval.status, ApprovalStatus::Approved);
    assert_eq!(approval.decided_by.as_deref(), Some("alice"));
    assert_eq!(task(&h, &t.id).await.status, TaskStatus::Completed);
    let runs = h.mc.storage().runs_for_task(&t.id).await;
    assert!(runs.iter().all(|run| run.status == RunStatus::Completed));
    let artifact = h.mc.artifacts().deliverable_path(&t.id);
    let body = tokio::fs::read_to_string(&artifact).await.expect("artifact");
    assert!(body.contains("alice"), "{body}");

    let again = h.mc.approve(&approval_id, "bob", None).await;
    assert!(matches!(again, Err(MissionError::Conflict(_))));
}

#[tokio::test]
async fn rejection_redispatches_with_the_note_in_the_prompt() {
    let h = harness().await;
    let t = create(&h, "Unit economics", "acme", None).await;
    let approval_id = run_to_review(&h, &t.id).await;

    let receipt = h
        .mc
        .reject(&approval_id, "fix units", "carol", None)
        .await
        .expect("reject");
    assert_eq!(receipt.status, TaskStatus::InExecution);
    h.mc.settle().await;

    let runs = h.mc.storage().runs_for_task(&t.id).await;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].id, receipt.run_id);
    let prompt = runs[1].prompt.clone().expect("prompt stored");
    assert!(prompt.contains("fix units"));
    assert!(prompt.contains("Feedback Applied Checklist"));
    assert!(!runs[0].prompt.clone().unwrap_or_default().contains("fix units"));

    let handoffs = h.mc.storage().handoffs_for_task(&t.id).await;
    let rework = handoffs
        .iter()
        .find(|h| h.kind == HandoffKind::Rework)
        .expect("rework handoff");
    assert_eq!(rework.from_role, "hitl:carol");
    assert_eq!(rework.reason, "fix units");

    let rejected = h.mc.storage().get_approval(&approval_id).await.expect("approval");
    assert_eq!(rejected.status, ApprovalStatus::Rejected);
    assert!(task(&h, &t.id).await.revision_note.is_none());
}

#[tokio::test]
async fn rejection_requires_a_note() {
    let h = harness().await;
    let t = create(&h, "Blog post", "acme", None).await;
    let approval_id = run_to_review(&h, &t.id).await;
    let err = h.mc.reject(&approval_id, "   ", "carol", None).await.expect_err("no note");
    assert_eq!(err.code(), "INVALID_INPUT");
    assert_eq!(task(&h, &t.id).await.status, TaskStatus::HitlReview);
}

#[tokio::test]
async fn timeout_during_review_keeps_the_task_in_review() {
    let h = harness_with(json!({"execution": {"timeout_secs": 1}})).await;
    let t = create(&h, "Slow research", "acme", None).await;
    h.peer.push(ScriptedSession::Hang).await;

    let receipt = h.mc.orchestrate(&t.id, None, None).await.expect("orchestrate");
    let id = t.id.clone();
    h.mc.storage()
        .transact(move |state| {
            state.transition(&id, TaskStatus::HitlReview, chrono::Utc::now())?;
            Ok(())
        })
        .await
        .expect("move to review");
    h.mc.settle().await;

    assert_eq!(task(&h, &t.id).await.status, TaskStatus::HitlReview);
    let run = h.mc.storage().get_run(&receipt.run_id).await.expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("did not finish")));
    assert!(h
        .mc
        .artifacts()
        .error_report_path(&t.id, &receipt.run_id)
        .exists());
}

#[tokio::test]
async fn timeout_outside_review_fails_the_task() {
    let h = harness_with(json!({"execution": {"timeout_secs": 1}})).await;
    let t = create(&h, "Slow research", "acme", None).await;
    h.peer.push(ScriptedSession::Hang).await;
    h.mc.orchestrate(&t.id, None, None).await.expect("orchestrate");
    h.mc.settle().await;
    assert_eq!(task(&h, &t.id).await.status, TaskStatus::Failed);

    let receipt = h.mc.retry(&t.id, None).await.expect("retry");
    h.mc.settle().await;
    assert_eq!(task(&h, &t.id).await.status, TaskStatus::HitlReview);
    let runs = h.mc.storage().runs_for_task(&t.id).await;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].id, receipt.run_id);
}

#[tokio::test]
async fn endless_tool_stream_is_cut_off() {
    let h = harness().await;
    let t = create(&h, "Looping search", "acme", None).await;
    h.peer
        .push(ScriptedSession::Endless {
            tool: "search_tasks".into(),
            args: json!({"query": "loop"}),
        })
        .await;
    let receipt = h.mc.orchestrate(&t.id, None, None).await.expect("orchestrate");
    h.mc.settle().await;

    let run = h.mc.storage().get_run(&receipt.run_id).await.expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("limit of 6")));
    assert_eq!(h.peer.tool_results().await.len(), 6);
    assert_eq!(task(&h, &t.id).await.status, TaskStatus::Failed);
}

#[tokio::test]
async fn duplicate_tool_calls_run_once() {
    let h = harness().await;
    let t = create(&h, "Find related work", "acme", None).await;
    let args = json!({"query": "related"});
    h.peer
        .push(ScriptedSession::Turns(vec![
            vec![
                tool_call("dup", "search_tasks", args.clone()),
                tool_call("dup", "search_tasks", args),
            ],
            vec![PeerEvent::Final {
                text: Some("Found nothing else.".into()),
                usage: None,
            }],
        ]))
        .await;
    h.mc.orchestrate(&t.id, None, None).await.expect("orchestrate");
    h.mc.settle().await;

    assert_eq!(h.peer.tool_results().await.len(), 1);
    assert_eq!(task(&h, &t.id).await.status, TaskStatus::HitlReview);
    let spans = h.mc.tracer().spans_for_task(&t.id).await.expect("spans");
    let tool_spans = spans
        .iter()
        .filter(|s| s.kind == SpanKind::ToolCall)
        .collect::<Vec<_>>();
    assert_eq!(tool_spans.len(), 1);
    assert!(tool_spans[0].args_hash.is_some());
}

#[tokio::test]
async fn tool_names_are_normalized_before_execution() {
    let h = harness().await;
    let t = create(&h, "Status digest", "acme", None).await;
    h.peer
        .push(ScriptedSession::tool_then_reply(
            " Read_Task ",
            json!({"task_id": t.id}),
            "Digest ready.",
        ))
        .await;
    h.mc.orchestrate(&t.id, None, None).await.expect("orchestrate");
    h.mc.settle().await;

    let results = h.peer.tool_results().await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].1.is_error, "{}", results[0].1.output);
    assert!(results[0].1.output.contains("Status digest"));
    assert_eq!(task(&h, &t.id).await.status, TaskStatus::HitlReview);
}

#[tokio::test]
async fn token_usage_provenance_is_recorded() {
    let h = harness().await;
    let exact = create(&h, "Exact accounting", "acme", None).await;
    let estimated = create(&h, "Estimated accounting", "acme", None).await;
    h.peer
        .push(ScriptedSession::reply_with_usage("Done.", 100, 20))
        .await;
    h.mc.orchestrate(&exact.id, None, None).await.expect("orchestrate");
    h.mc.settle().await;
    h.mc.orchestrate(&estimated.id, None, None).await.expect("orchestrate");
    h.mc.settle().await;

    let llm_span = |spans: Vec<mctl_types::Span>| {
        spans
            .into_iter()
            .find(|s| s.kind == SpanKind::LlmCall)
            .expect("llm span")
    };
    let span = llm_span(h.mc.tracer().spans_for_task(&exact.id).await.expect("spans"));
    assert_eq!(span.tokens, Some(120));
    assert_eq!(span.token_source, Some(TokenSource::Exact));
    assert_eq!(span.model.as_deref(), Some("scripted-model"));

    let span = llm_span(h.mc.tracer().spans_for_task(&estimated.id).await.expect("spans"));
    assert_eq!(span.token_source, Some(TokenSource::Estimated));
    assert!(span.tokens.unwrap_or_default() > 0);

    let summary = h.mc.trace_summary().await.expect("summary");
    assert_eq!(summary.coverage.exact_tokens, 120);
}

#[tokio::test]
async fn cross_tenant_tool_call_fails_the_run() {
    let h = harness().await;
    let foreign = create(&h, "Globex secrets", "globex", None).await;
    let t = create(&h, "Peek next door", "acme", None).await;
    h.peer
        .push(ScriptedSession::tool_then_reply(
            "read_task",
            json!({"task_id": foreign.id}),
            "should never get here",
        ))
        .await;
    let receipt = h.mc.orchestrate(&t.id, None, None).await.expect("orchestrate");
    h.mc.settle().await;

    let run = h.mc.storage().get_run(&receipt.run_id).await.expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run
        .output_summary
        .as_deref()
        .is_some_and(|r| r.contains("TENANT_ISOLATION_BLOCK")));
    assert!(h.peer.tool_results().await.is_empty());
    assert_eq!(task(&h, &t.id).await.status, TaskStatus::Failed);
}

#[tokio::test]
async fn banned_tool_fails_and_gated_tool_escalates() {
    let h = harness().await;
    let banned = create(&h, "Clean up disk", "acme", None).await;
    h.peer
        .push(ScriptedSession::tool_then_reply("shell", json!({"cmd": "rm -rf /"}), "done"))
        .await;
    h.mc.orchestrate(&banned.id, None, None).await.expect("orchestrate");
    h.mc.settle().await;
    assert_eq!(task(&h, &banned.id).await.status, TaskStatus::Failed);
    let run = &h.mc.storage().runs_for_task(&banned.id).await[0];
    assert!(run
        .output_summary
        .as_deref()
        .is_some_and(|r| r.contains("POLICY_BLOCK")));

    let gated = create(&h, "Tell the customer", "acme", None).await;
    h.peer
        .push(ScriptedSession::tool_then_reply(
            "send_message",
            json!({"to": "customer", "body": "hi"}),
            "sent",
        ))
        .await;
    h.mc.orchestrate(&gated.id, None, None).await.expect("orchestrate");
    h.mc.settle().await;
    assert_eq!(task(&h, &gated.id).await.status, TaskStatus::HitlReview);
    let approvals = h.mc.storage().approvals_for_task(&gated.id).await;
    assert_eq!(approvals.len(), 1);
    assert!(approvals[0].gate_reason.starts_with("policy:"));
    let run = &h.mc.storage().runs_for_task(&gated.id).await[0];
    assert_eq!(run.status, RunStatus::HitlReview);
    let spans = h.mc.tracer().spans_for_task(&gated.id).await.expect("spans");
    assert!(spans.iter().any(|s| s.kind == SpanKind::HitlGate));
}

#[tokio::test]
async fn untrusted_telegram_origin_escalates_reads() {
    let h = harness().await;
    let mut origin = TaskOrigin::channel(OriginChannel::Telegram);
    origin.sender_id = Some("stranger".into());
    let dry_run = h
        .mc
        .classify_tool("read_task", &json!({"task_id": "t"}), origin)
        .await;
    assert!(dry_run.untrusted);
    assert_eq!(dry_run.verdict.decision, PolicyDecision::HitlRequired);

    let fetch = h
        .mc
        .classify_tool(
            "scrape_and_parse_url",
            &json!({"url": "https://evil.example/x"}),
            TaskOrigin::default(),
        )
        .await;
    assert_eq!(fetch.verdict.decision, PolicyDecision::Banned);
    assert!(fetch.verdict.reason.contains("evil.example"));
}

#[tokio::test]
async fn severe_insight_replans_ahead_of_siblings() {
    let h = harness_with(json!({"workflow": {"auto_orchestrate_mitigations": false}})).await;
    let parent = create(&h, "Launch plan", "acme", None).await;
    let child1 = create(&h, "Pricing page", "acme", Some(&parent.id)).await;
    let child2 = create(&h, "Press kit", "acme", Some(&parent.id)).await;

    let insight = h
        .mc
        .submit_insight(NewInsight {
            parent_task_id: parent.id.clone(),
            status: "open".into(),
            claim: "pricing data is wrong".into(),
            severity: Severity::S3,
            evidence_refs: vec![],
            affected_tasks: vec![child1.id.clone()],
            suggested_next_tasks: vec![],
            source_role: None,
        })
        .await
        .expect("insight");
    h.mc.settle().await;

    assert_eq!(task(&h, &parent.id).await.interrupt_count, 1);
    assert_eq!(task(&h, &child1.id).await.status, TaskStatus::Blocked);
    assert_eq!(task(&h, &child2.id).await.status, TaskStatus::Intake);
    let children = h.mc.storage().children(&parent.id).await;
    let mitigations = children
        .iter()
        .filter(|c| c.kind == TaskKind::Mitigation)
        .collect::<Vec<_>>();
    assert_eq!(mitigations.len(), 1);
    let mitigation = mitigations[0];
    assert!(children
        .iter()
        .filter(|c| c.id != mitigation.id)
        .all(|c| mitigation.execution_order < c.execution_order));
    assert!(mitigation
        .context_payload
        .as_ref()
        .is_some_and(|p| p["insight_id"] == insight.id.as_str()));
}

#[tokio::test]
async fn circuit_breaker_trips_and_resets_without_lowering_the_count() {
    let h = harness_with(json!({"workflow": {"auto_orchestrate_mitigations": false}})).await;
    let mut input = NewTask::new("Migration", "move the billing database", "acme");
    input.max_interrupts = 1;
    let parent = h.mc.create_task(input, false).await.expect("parent");
    create(&h, "Schema diff", "acme", Some(&parent.id)).await;

    let submit = |claim: &str| NewInsight {
        parent_task_id: parent.id.clone(),
        status: "open".into(),
        claim: claim.into(),
        severity: Severity::S2,
        evidence_refs: vec![],
        affected_tasks: vec![],
        suggested_next_tasks: vec![],
        source_role: None,
    };

    h.mc.submit_insight(submit("lock contention")).await.expect("insight");
    h.mc.settle().await;
    assert_eq!(task(&h, &parent.id).await.interrupt_count, 1);
    assert_eq!(task(&h, &parent.id).await.status, TaskStatus::Intake);

    let mut counts = Vec::new();
    for claim in ["replica lag", "replica lag again"] {
        let insight = h.mc.submit_insight(submit(claim)).await.expect("insight");
        h.mc.settle().await;
        assert!(!insight.id.is_empty());
        counts.push(task(&h, &parent.id).await.interrupt_count);
    }
    let parent_now = task(&h, &parent.id).await;
    assert_eq!(parent_now.status, TaskStatus::Blocked);
    assert!(counts.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(parent_now.interrupt_count, parent_now.max_interrupts);
    let mitigations_before = h
        .mc
        .storage()
        .children(&parent.id)
        .await
        .iter()
        .filter(|c| c.kind == TaskKind::Mitigation)
        .count();
    assert_eq!(mitigations_before, 1);
    assert!(h
        .notifier
        .sent()
        .await
        .iter()
        .any(|n| n.urgency == Urgency::Urgent));

    let reset = h
        .mc
        .reset_circuit(&parent.id, "dana", Some(2))
        .await
        .expect("reset");
    assert_eq!(reset.status, TaskStatus::Intake);
    assert_eq!(reset.interrupt_count, parent_now.interrupt_count);
    assert!(reset.max_interrupts > reset.interrupt_count);

    let after = h.mc.submit_insight(submit("one more")).await.expect("insight");
    let outcome = h.mc.apply_replan(&after.id).await.expect("replan");
    assert!(matches!(outcome, ReplanOutcome::Applied { .. }));
    h.mc.settle().await;
    assert_eq!(
        task(&h, &parent.id).await.interrupt_count,
        parent_now.interrupt_count + 1
    );
}

#[tokio::test]
async fn concurrent_fan_in_creates_one_synthesis() {
    let h = harness().await;
    let parent = create(&h, "Market survey", "acme", None).await;
    for title in ["Region north", "Region south"] {
        let child = create(&h, title, "acme", Some(&parent.id)).await;
        force_status(&h, &child.id, TaskStatus::Completed).await;
    }

    let (a, b) = tokio::join!(
        h.mc.evaluate_parent(&parent.id),
        h.mc.evaluate_parent(&parent.id)
    );
    let outcomes = [a.expect("first"), b.expect("second")];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, FanInOutcome::Created { .. }))
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, FanInOutcome::AlreadySynthesized { .. }))
            .count(),
        1
    );
    h.mc.settle().await;

    let synthesis = h
        .mc
        .storage()
        .children(&parent.id)
        .await
        .into_iter()
        .filter(|c| c.kind == TaskKind::Synthesis)
        .collect::<Vec<_>>();
    assert_eq!(synthesis.len(), 1);
    // Synthesis tasks finish without a human gate.
    assert_eq!(synthesis[0].status, TaskStatus::Completed);
    let handoffs = h.mc.storage().handoffs_for_task(&synthesis[0].id).await;
    assert!(handoffs.iter().any(|h| h.kind == HandoffKind::Synthesis));
}

#[tokio::test]
async fn approving_the_last_child_triggers_synthesis() {
    let h = harness().await;
    let parent = create(&h, "Board memo", "acme", None).await;
    let child = create(&h, "Revenue section", "acme", Some(&parent.id)).await;
    let approval_id = run_to_review(&h, &child.id).await;
    h.mc.approve(&approval_id, "erin", None).await.expect("approve");
    h.mc.settle().await;

    let children = h.mc.storage().children(&parent.id).await;
    assert!(children.iter().any(|c| c.kind == TaskKind::Synthesis));
}

#[tokio::test]
async fn verifier_gates_synthesis_until_approved() {
    let h = harness_with(json!({"workflow": {"verifier_role": "verifier"}})).await;
    let parent = create(&h, "Security review", "acme", None).await;
    let child = create(&h, "Dependency audit", "acme", Some(&parent.id)).await;
    force_status(&h, &child.id, TaskStatus::Completed).await;

    let outcome = h.mc.evaluate_fan_in(&child.id).await.expect("fan-in");
    assert_eq!(outcome, FanInOutcome::AwaitingVerdict);

    h.mc.submit_review(NewReview {
        task_id: parent.id.clone(),
        verdict: Verdict::Approve,
        reviewer: String::new(),
        summary: "looks good".into(),
        affected_tasks: vec![],
    })
    .await
    .expect("review");
    h.mc.settle().await;

    let children = h.mc.storage().children(&parent.id).await;
    assert!(children.iter().any(|c| c.kind == TaskKind::Synthesis));
    let reviews = h.mc.storage().reviews_for_task(&parent.id).await;
    assert_eq!(reviews[0].reviewer, "verifier");
}

#[tokio::test]
async fn revision_and_block_verdicts_move_tasks() {
    let h = harness().await;
    let parent = create(&h, "Product launch", "acme", None).await;
    let child = create(&h, "Landing copy", "acme", Some(&parent.id)).await;

    h.mc.submit_review(NewReview {
        task_id: parent.id.clone(),
        verdict: Verdict::NeedsRevision,
        reviewer: "verifier".into(),
        summary: "copy contradicts pricing".into(),
        affected_tasks: vec![child.id.clone()],
    })
    .await
    .expect("revision");
    assert_eq!(task(&h, &child.id).await.status, TaskStatus::NeedsUpdate);
    assert_eq!(task(&h, &parent.id).await.status, TaskStatus::Intake);

    h.mc.submit_review(NewReview {
        task_id: parent.id.clone(),
        verdict: Verdict::Block,
        reviewer: "verifier".into(),
        summary: "legal has not signed off".into(),
        affected_tasks: vec![],
    })
    .await
    .expect("block");
    h.mc.settle().await;
    assert_eq!(task(&h, &parent.id).await.status, TaskStatus::Blocked);
    let sent = h.notifier.sent().await;
    assert!(sent
        .iter()
        .any(|n| n.urgency == Urgency::Urgent && n.body.contains("legal")));
}

#[tokio::test]
async fn revision_verdict_stays_inside_the_reviewed_subtree() {
    let h = harness().await;
    let parent = create(&h, "Annual report", "acme", None).await;
    let child = create(&h, "Financials", "acme", Some(&parent.id)).await;
    let grandchild = create(&h, "Cash flow", "acme", Some(&child.id)).await;
    let sibling_root = create(&h, "Unrelated plan", "acme", None).await;
    let foreign = create(&h, "Rival roadmap", "globex", None).await;

    h.mc.submit_review(NewReview {
        task_id: parent.id.clone(),
        verdict: Verdict::NeedsRevision,
        reviewer: "verifier".into(),
        summary: "numbers disagree".into(),
        affected_tasks: vec![
            grandchild.id.clone(),
            sibling_root.id.clone(),
            foreign.id.clone(),
        ],
    })
    .await
    .expect("revision");

    assert_eq!(task(&h, &grandchild.id).await.status, TaskStatus::NeedsUpdate);
    assert_eq!(task(&h, &child.id).await.status, TaskStatus::Intake);
    assert_eq!(task(&h, &sibling_root.id).await.status, TaskStatus::Intake);
    assert_eq!(task(&h, &foreign.id).await.status, TaskStatus::Intake);
}

#[tokio::test]
async fn zombie_sweep_fails_stale_runs_and_purge_cascades() {
    let h = harness_with(json!({"execution": {"zombie_stale_secs": 0}})).await;
    let t = create(&h, "Stuck job", "acme", None).await;
    h.peer.push(ScriptedSession::Hang).await;
    let receipt = h.mc.orchestrate(&t.id, None, None).await.expect("orchestrate");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let report = h.mc.run_maintenance().await.expect("sweep");
    assert_eq!(report.zombie_tasks, vec![t.id.clone()]);
    assert_eq!(task(&h, &t.id).await.status, TaskStatus::Failed);
    let run = h.mc.storage().get_run(&receipt.run_id).await.expect("run");
    assert_eq!(run.status, RunStatus::Failed);

    let summary = h.mc.purge_task(&t.id).await.expect("purge");
    assert_eq!(summary.records.runs, 1);
    assert!(h.mc.storage().get_task(&t.id).await.is_none());
    assert!(h.mc.storage().get_run(&receipt.run_id).await.is_none());
}

#[tokio::test]
async fn cross_tenant_requests_see_nothing() {
    let h = harness().await;
    let t = create(&h, "Private", "acme", None).await;
    let err = h
        .mc
        .orchestrate(&t.id, Some("globex"), None)
        .await
        .expect_err("hidden");
    assert_eq!(err.code(), "NOT_FOUND");
    assert!(h.mc.storage().runs_for_task(&t.id).await.is_empty());

    let child = NewTask {
        parent_id: Some(t.id.clone()),
        ..NewTask::new("Leak", "cross tenant child", "globex")
    };
    let err = h.mc.create_task(child, false).await.expect_err("tenant");
    assert_eq!(err.code(), "INVALID_INPUT");
}
