//! End-to-end runs of composition plans against in-process agents.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use concerto_core::{
    agent_fn, AgentContract, AgentFailure, AgentTable, Branch, CapabilityRegistry, Classifier,
    ClusterId, CompositionNode, Condition, Context, Engine, EngineConfig, EngineError, ErrorKind,
    FailurePolicy, GateNode, GateResolution, InputMapping, LeafNode, NodeStatus, OnTimeout,
    PlanDefinition, ProgressEvent, RunStatus, ScriptedAgent, ScriptedResponse, SignalOutcome,
    WorkflowStatus,
};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_stream::StreamExt;

// ─── Helpers ──────────────────────────────────────────────────────────────

fn engine(agents: AgentTable) -> Engine {
    let mut registry = CapabilityRegistry::new();
    for name in agents.names() {
        registry
            .register(AgentContract::new(name, 1))
            .expect("unique agent names");
    }
    Engine::new(Arc::new(registry), Arc::new(agents), EngineConfig::default())
}

fn leaf(agent: &str, output_key: &str) -> CompositionNode {
    LeafNode::new(agent, output_key).into()
}

fn leaf_from(agent: &str, field: &str, key: &str, output_key: &str) -> CompositionNode {
    LeafNode::new(agent, output_key)
        .input(InputMapping::new().from_key(field, key))
        .into()
}

/// Agent that sleeps, then answers with a fixed value.
fn delayed(ms: u64, value: Value) -> Arc<dyn concerto_core::Agent> {
    agent_fn(move |_| {
        let value = value.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, AgentFailure>(value)
        }
    })
}

/// Agent that counts its calls and answers `"ok"`.
fn counting(calls: &Arc<AtomicUsize>) -> Arc<dyn concerto_core::Agent> {
    let calls = calls.clone();
    agent_fn(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, AgentFailure>(json!("ok")) }
    })
}

fn failing(ms: u64, message: &'static str) -> Arc<dyn concerto_core::Agent> {
    agent_fn(move |_| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Err::<Value, _>(AgentFailure::new(message))
    })
}

// ─── Sequential ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sequential_children_see_prior_writes() {
    let agents = AgentTable::new()
        .with("a", agent_fn(|_| async { Ok::<_, AgentFailure>(json!(1)) }))
        .with(
            "b",
            agent_fn(|input: Value| async move {
                Ok::<_, AgentFailure>(json!(input["x"].as_i64().unwrap_or(0) + 1))
            }),
        )
        .with(
            "c",
            agent_fn(|input: Value| async move {
                Ok::<_, AgentFailure>(json!(input["y"].as_i64().unwrap_or(0) * 2))
            }),
        );
    let root = CompositionNode::sequential(vec![
        leaf("a", "x"),
        leaf_from("b", "x", "x", "y"),
        leaf_from("c", "y", "y", "z"),
    ]);

    let result = engine(agents).run_node(&root, Context::new()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.get("x"), Some(&json!(1)));
    assert_eq!(result.get("y"), Some(&json!(2)));
    assert_eq!(result.get("z"), Some(&json!(4)));
    let writers: Vec<&str> = result.audit.iter().map(|r| r.writer.as_str()).collect();
    assert_eq!(writers, vec!["root/0", "root/1", "root/2"]);
}

#[tokio::test]
async fn test_sequential_failure_skips_the_rest() {
    let downstream = Arc::new(AtomicUsize::new(0));
    let agents = AgentTable::new()
        .with("broken", failing(0, "model unavailable"))
        .with("after", counting(&downstream));
    let root = CompositionNode::sequential(vec![leaf("broken", "x"), leaf("after", "y")]);

    let result = engine(agents).run_node(&root, Context::new()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.node("root/1").unwrap().status, NodeStatus::Skipped);
    assert_eq!(downstream.load(Ordering::SeqCst), 0);
    let error = result.trace.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Invocation);
    assert!(error.message.contains("model unavailable"));
}

#[tokio::test]
async fn test_missing_input_key_fails_leaf_without_calling_agent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let agents = AgentTable::new().with("critic", counting(&calls));
    let root = leaf_from("critic", "text", "draft", "verdict");

    let result = engine(agents).run_node(&root, Context::new()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.trace.error.as_ref().unwrap().kind, ErrorKind::Validation);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ─── Parallel ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_parallel_duration_is_bounded_by_slowest_branch() {
    let agents = AgentTable::new()
        .with("fast", delayed(50, json!(1)))
        .with("slow", delayed(200, json!(2)))
        .with("mid", delayed(10, json!(3)));
    let root = CompositionNode::parallel(
        vec![
            Branch::new("fast", LeafNode::new("fast", "a")),
            Branch::new("slow", LeafNode::new("slow", "b")),
            Branch::new("mid", LeafNode::new("mid", "c")),
        ],
        FailurePolicy::AbortAll,
    );

    let started = Instant::now();
    let result = engine(agents).run_node(&root, Context::new()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(260), "took {:?}", elapsed);
    assert_eq!(result.get("fast.a"), Some(&json!(1)));
    assert_eq!(result.get("slow.b"), Some(&json!(2)));
    assert_eq!(result.get("mid.c"), Some(&json!(3)));
    assert!(result.get("a").is_none());

    // Merged in declared order, not completion order.
    let keys: Vec<&str> = result.audit.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["fast.a", "slow.b", "mid.c"]);
}

#[tokio::test(start_paused = true)]
async fn test_abort_all_cancels_siblings_and_merges_nothing() {
    let agents = AgentTable::new()
        .with("quick", delayed(10, json!("done")))
        .with("broken", failing(20, "boom"))
        .with("slow", delayed(10_000, json!("late")));
    let root = CompositionNode::parallel(
        vec![
            Branch::new("quick", LeafNode::new("quick", "out")),
            Branch::new("broken", LeafNode::new("broken", "out")),
            Branch::new("slow", LeafNode::new("slow", "out")),
        ],
        FailurePolicy::AbortAll,
    );

    let started = Instant::now();
    let result = engine(agents)
        .run_node(&root, Context::from_json(json!({ "seed": true })))
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.context.keys().collect::<Vec<_>>(), vec!["seed"]);
    assert!(result.audit.is_empty());
    assert_eq!(result.node("root/quick").unwrap().status, NodeStatus::Completed);
    assert_eq!(result.node("root/broken").unwrap().status, NodeStatus::Failed);
    assert_eq!(result.node("root/slow").unwrap().status, NodeStatus::Cancelled);
    assert_eq!(result.trace.error.as_ref().unwrap().kind, ErrorKind::Invocation);
}

#[tokio::test(start_paused = true)]
async fn test_best_effort_merges_survivors() {
    let agents = AgentTable::new()
        .with("ok", delayed(30, json!("notes")))
        .with("broken", failing(5, "boom"));
    let root = CompositionNode::parallel(
        vec![
            Branch::new("style", LeafNode::new("ok", "review")),
            Branch::new("facts", LeafNode::new("broken", "review")),
        ],
        FailurePolicy::BestEffort,
    );

    let result = engine(agents).run_node(&root, Context::new()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::PartiallyCompleted);
    assert_eq!(result.get("style.review"), Some(&json!("notes")));
    assert!(result.get("facts.review").is_none());
    assert_eq!(result.node("root/style").unwrap().status, NodeStatus::Completed);
    assert!(result.trace.error.is_some());
}

#[tokio::test]
async fn test_best_effort_with_no_survivors_fails() {
    let agents = AgentTable::new().with("broken", failing(0, "boom"));
    let root = CompositionNode::parallel(
        vec![
            Branch::new("one", LeafNode::new("broken", "x")),
            Branch::new("two", LeafNode::new("broken", "x")),
        ],
        FailurePolicy::BestEffort,
    );

    let result = engine(agents).run_node(&root, Context::new()).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
}

// ─── Loop ─────────────────────────────────────────────────────────────────

fn review_loop(max_iterations: u32) -> CompositionNode {
    CompositionNode::repeat(
        leaf("critic", "verdict"),
        Condition::equals("verdict", "APPROVED"),
        max_iterations,
    )
}

#[tokio::test]
async fn test_loop_stops_when_condition_holds() {
    let critic = Arc::new(ScriptedAgent::new(vec![
        ScriptedResponse::ok(json!("REVISE")),
        ScriptedResponse::ok(json!("REVISE")),
        ScriptedResponse::ok(json!("APPROVED")),
    ]));
    let agents = AgentTable::new().with("critic", critic.clone());

    let result = engine(agents)
        .run_node(&review_loop(5), Context::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.trace.iterations, Some(3));
    assert!(!result.trace.exceeded);
    assert_eq!(critic.calls(), 3);
    assert_eq!(result.trace.children.len(), 3);
    assert!(result.node("root/iter3").is_some());
}

#[tokio::test]
async fn test_loop_cap_is_a_completion_not_a_failure() {
    let critic = Arc::new(ScriptedAgent::new(vec![ScriptedResponse::ok(json!("REVISE"))]));
    let agents = AgentTable::new().with("critic", critic.clone());

    let result = engine(agents)
        .run_node(&review_loop(5), Context::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.trace.iterations, Some(5));
    assert!(result.trace.exceeded);
    assert_eq!(critic.calls(), 5);
    // Every overwrite of the verdict is kept in the audit trail.
    assert_eq!(result.audit.len(), 5);
    assert_eq!(result.audit[4].previous, Some(json!("REVISE")));
}

#[tokio::test]
async fn test_unvalidated_zero_cap_loop_never_runs_its_body() {
    let critic = Arc::new(ScriptedAgent::new(vec![ScriptedResponse::ok(json!("APPROVED"))]));
    let mut registry = CapabilityRegistry::new();
    registry.register(AgentContract::new("critic", 1)).unwrap();
    let config = EngineConfig {
        validate_plans: false,
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        Arc::new(registry),
        Arc::new(AgentTable::new().with("critic", critic.clone())),
        config,
    );

    let result = engine.run_node(&review_loop(0), Context::new()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.trace.iterations, Some(0));
    assert!(result.trace.exceeded);
    assert_eq!(critic.calls(), 0);
    assert!(result.trace.children.is_empty());
}

#[tokio::test]
async fn test_failing_body_aborts_loop() {
    let agents = AgentTable::new().with("critic", failing(0, "crashed"));
    let result = engine(agents)
        .run_node(&review_loop(5), Context::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.trace.iterations, Some(1));
}

// ─── Coordinator ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_coordinator_runs_only_the_selected_cluster() {
    let research = Arc::new(AtomicUsize::new(0));
    let security = Arc::new(AtomicUsize::new(0));
    let agents = AgentTable::new()
        .with("router", agent_fn(|_| async { Ok::<_, AgentFailure>(json!("budget")) }))
        .with("researcher", counting(&research))
        .with("budgeter", delayed(0, json!({ "total": 1200 })))
        .with("auditor", counting(&security));
    let root = CompositionNode::coordinator(
        Classifier::agent("router", InputMapping::new().from_key("request", "request")),
        vec![
            ("research", leaf("researcher", "findings")),
            ("budget", leaf("budgeter", "budget")),
            ("security", leaf("auditor", "risks")),
        ],
    );

    let result = engine(agents)
        .run_node(&root, Context::from_json(json!({ "request": "plan the offsite" })))
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.get("budget"), Some(&json!({ "total": 1200 })));
    assert!(result.get("findings").is_none());
    assert!(result.get("risks").is_none());
    assert_eq!(research.load(Ordering::SeqCst), 0);
    assert_eq!(security.load(Ordering::SeqCst), 0);
    assert_eq!(result.trace.cluster.as_ref().map(|c| c.as_str()), Some("budget"));
    assert_eq!(result.trace.attempts, Some(1));
    assert!(result.node("root/budget").is_some());
}

#[tokio::test]
async fn test_unknown_cluster_fails() {
    let agents = AgentTable::new().with("researcher", delayed(0, json!("x")));
    let root = CompositionNode::coordinator(
        Classifier::key("route"),
        vec![("research", leaf("researcher", "findings"))],
    );

    let result = engine(agents)
        .run_node(&root, Context::from_json(json!({ "route": "legal" })))
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.trace.error.as_ref().unwrap().kind, ErrorKind::UnknownCluster);
    assert!(result.trace.children.is_empty());
}

#[tokio::test]
async fn test_custom_classifier() {
    let agents = AgentTable::new()
        .with("small", delayed(0, json!("s")))
        .with("large", delayed(0, json!("l")));
    let root = CompositionNode::coordinator(
        Classifier::custom(|ctx| {
            let size = ctx.get("size").and_then(|v| v.as_i64()).unwrap_or(0);
            ClusterId::from(if size > 10 { "large" } else { "small" })
        }),
        vec![("small", leaf("small", "out")), ("large", leaf("large", "out"))],
    );

    let result = engine(agents)
        .run_node(&root, Context::from_json(json!({ "size": 42 })))
        .await
        .unwrap();
    assert_eq!(result.get("out"), Some(&json!("l")));
}

fn routed(classifier: Classifier) -> CompositionNode {
    CompositionNode::coordinator(
        classifier,
        vec![
            ("research", leaf("researcher", "findings")),
            ("budget", leaf("budgeter", "budget")),
        ],
    )
}

fn router_agents(router: Arc<dyn concerto_core::Agent>, clusters: &Arc<AtomicUsize>) -> AgentTable {
    AgentTable::new()
        .with("router", router)
        .with("researcher", counting(clusters))
        .with("budgeter", counting(clusters))
}

#[tokio::test]
async fn test_failing_classifier_agent_fails_coordinator() {
    let clusters = Arc::new(AtomicUsize::new(0));
    let agents = router_agents(failing(0, "router crashed"), &clusters);

    let result = engine(agents)
        .run_node(&routed(Classifier::agent("router", InputMapping::new())), Context::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    let error = result.trace.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Invocation);
    assert!(error.message.contains("router crashed"));
    assert_eq!(result.trace.attempts, Some(1));
    assert!(result.trace.cluster.is_none());
    assert!(result.trace.children.is_empty());
    assert_eq!(clusters.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_classifier_agent_timeout_is_retried_then_fails() {
    let clusters = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let slow_router = {
        let calls = calls.clone();
        agent_fn(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, AgentFailure>(json!("budget"))
            }
        })
    };
    let agents = router_agents(slow_router, &clusters);
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            AgentContract::new("router", 1)
                .idempotent(2)
                .with_timeout(Duration::from_millis(50)),
        )
        .unwrap();
    registry.register(AgentContract::new("researcher", 1)).unwrap();
    registry.register(AgentContract::new("budgeter", 1)).unwrap();
    let engine = Engine::new(Arc::new(registry), Arc::new(agents), EngineConfig::default());

    let result = engine
        .run_node(&routed(Classifier::agent("router", InputMapping::new())), Context::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.trace.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(result.trace.attempts, Some(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(result.trace.children.is_empty());
    assert_eq!(clusters.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_classifier_agent_with_unusable_answer() {
    let clusters = Arc::new(AtomicUsize::new(0));
    let agents = router_agents(delayed(0, json!({ "route": "budget" })), &clusters);

    let result = engine(agents)
        .run_node(&routed(Classifier::agent("router", InputMapping::new())), Context::new())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.trace.error.as_ref().unwrap().kind, ErrorKind::Validation);
    assert_eq!(result.trace.attempts, Some(1));
    assert!(result.trace.children.is_empty());
    assert_eq!(clusters.load(Ordering::SeqCst), 0);
}

// ─── Gates ────────────────────────────────────────────────────────────────

fn gated(gate: GateNode, downstream: &Arc<AtomicUsize>) -> (AgentTable, CompositionNode) {
    let agents = AgentTable::new()
        .with("drafter", delayed(0, json!("draft")))
        .with("publisher", counting(downstream));
    let root = CompositionNode::sequential(vec![
        leaf("drafter", "draft"),
        gate.into(),
        leaf("publisher", "published"),
    ]);
    (agents, root)
}

#[tokio::test(start_paused = true)]
async fn test_gate_timeout_cancels_continuation() {
    let downstream = Arc::new(AtomicUsize::new(0));
    let (agents, root) = gated(
        GateNode::external("publish", Duration::from_millis(100), OnTimeout::Cancel),
        &downstream,
    );

    let started = Instant::now();
    let result = engine(agents).run_node(&root, Context::new()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(150), "took {:?}", elapsed);
    assert_eq!(downstream.load(Ordering::SeqCst), 0);
    let gate = result.node("root/1").unwrap();
    assert_eq!(gate.gate, Some(GateResolution::TimedOutCancelled));
    assert_eq!(gate.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(result.node("root/2").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test(start_paused = true)]
async fn test_gate_timeout_can_proceed() {
    let downstream = Arc::new(AtomicUsize::new(0));
    let (agents, root) = gated(
        GateNode::external("publish", Duration::from_millis(100), OnTimeout::ProceedDefault),
        &downstream,
    );

    let result = engine(agents).run_node(&root, Context::new()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(downstream.load(Ordering::SeqCst), 1);
    assert_eq!(
        result.node("root/1").unwrap().gate,
        Some(GateResolution::TimedOutProceeded)
    );
}

#[tokio::test]
async fn test_when_gate_passes_if_condition_already_holds() {
    let downstream = Arc::new(AtomicUsize::new(0));
    let (agents, root) = gated(
        GateNode::external("publish", Duration::from_secs(3600), OnTimeout::Cancel)
            .when(Condition::exists("draft")),
        &downstream,
    );

    let result = engine(agents).run_node(&root, Context::new()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(
        result.node("root/1").unwrap().gate,
        Some(GateResolution::PassedCondition)
    );
    assert_eq!(downstream.load(Ordering::SeqCst), 1);
}

async fn wait_for_gate(handle: &concerto_core::WorkflowHandle) -> String {
    let mut events = Box::pin(handle.progress());
    while let Some(event) = events.next().await {
        if let ProgressEvent::GatePending { gate_id, .. } = event {
            return gate_id;
        }
    }
    panic!("run finished without reaching a gate");
}

#[tokio::test]
async fn test_approved_gate_continues() {
    let downstream = Arc::new(AtomicUsize::new(0));
    let (agents, root) = gated(
        GateNode::external("publish", Duration::from_secs(60), OnTimeout::Cancel),
        &downstream,
    );
    let engine = engine(agents);
    let handle = engine.submit_node(root, Context::new()).unwrap();

    let gate_id = wait_for_gate(&handle).await;
    assert_eq!(gate_id, format!("{}:root/1", handle.run_id()));
    assert_eq!(handle.status(), RunStatus::WaitingOnGate);
    assert_eq!(handle.pending_gates()[0].name, "publish");

    assert_eq!(engine.resolve_gate(&gate_id, true), SignalOutcome::Delivered);
    assert_eq!(engine.resolve_gate(&gate_id, false), SignalOutcome::AlreadyResolved);

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.node("root/1").unwrap().gate, Some(GateResolution::Approved));
    assert_eq!(downstream.load(Ordering::SeqCst), 1);

    // The run is over; signals for it are ignored.
    assert_eq!(engine.resolve_gate(&gate_id, true), SignalOutcome::UnknownRun);
}

#[tokio::test]
async fn test_rejected_gate_cancels_workflow() {
    let downstream = Arc::new(AtomicUsize::new(0));
    let (agents, root) = gated(
        GateNode::external("publish", Duration::from_secs(60), OnTimeout::Cancel),
        &downstream,
    );
    let engine = engine(agents);
    let handle = engine.submit_node(root, Context::new()).unwrap();

    let gate_id = wait_for_gate(&handle).await;
    engine.resolve_gate(&gate_id, false);

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert_eq!(result.node("root/1").unwrap().gate, Some(GateResolution::Rejected));
    assert_eq!(downstream.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_signal_before_gate_is_reached() {
    let downstream = Arc::new(AtomicUsize::new(0));
    let agents = AgentTable::new()
        .with("drafter", delayed(50, json!("draft")))
        .with("publisher", counting(&downstream));
    let root = CompositionNode::sequential(vec![
        leaf("drafter", "draft"),
        GateNode::external("publish", Duration::from_secs(60), OnTimeout::Cancel).into(),
        leaf("publisher", "published"),
    ]);
    let handle = engine(agents).submit_node(root, Context::new()).unwrap();

    assert_eq!(handle.resolve_gate("root/1", true), SignalOutcome::Recorded);

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.node("root/1").unwrap().gate, Some(GateResolution::Approved));
    assert_eq!(downstream.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_run_releases_its_gate() {
    let downstream = Arc::new(AtomicUsize::new(0));
    let (agents, root) = gated(
        GateNode::external("publish", Duration::from_secs(3600), OnTimeout::Cancel),
        &downstream,
    );
    let engine = engine(agents);

    let mut run = Box::pin(engine.run_node(&root, Context::new()));
    let gate_id = loop {
        tokio::select! {
            _ = &mut run => panic!("run finished without reaching the gate"),
            _ = tokio::time::sleep(Duration::from_millis(1)) => {}
        }
        if let Some(gate) = engine.gates().pending().first() {
            break gate.gate_id.clone();
        }
    };
    drop(run);

    assert!(engine.gates().pending().is_empty());
    assert_eq!(engine.resolve_gate(&gate_id, true), SignalOutcome::UnknownRun);
    assert_eq!(downstream.load(Ordering::SeqCst), 0);
}

// ─── Handles, cancellation and progress ──────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_all_branches() {
    let after = Arc::new(AtomicUsize::new(0));
    let agents = AgentTable::new()
        .with("slow", delayed(10_000, json!("late")))
        .with("after", counting(&after));
    let root = CompositionNode::sequential(vec![
        CompositionNode::parallel(
            vec![
                Branch::new("one", LeafNode::new("slow", "x")),
                Branch::new("two", LeafNode::new("slow", "x")),
            ],
            FailurePolicy::BestEffort,
        ),
        leaf("after", "y"),
    ]);
    let handle = engine(agents).submit_node(root, Context::new()).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.status(), RunStatus::Running);
    let started = Instant::now();
    handle.cancel();
    let result = handle.wait().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert_eq!(result.node("root/0/one").unwrap().status, NodeStatus::Cancelled);
    assert_eq!(result.node("root/0/two").unwrap().status, NodeStatus::Cancelled);
    assert_eq!(result.node("root/1").unwrap().status, NodeStatus::Skipped);
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert!(result.context.is_empty());
}

#[tokio::test]
async fn test_progress_resubscription_replays_frontier() {
    let downstream = Arc::new(AtomicUsize::new(0));
    let (agents, root) = gated(
        GateNode::external("publish", Duration::from_secs(60), OnTimeout::Cancel),
        &downstream,
    );
    let engine = engine(agents);
    let handle = engine.submit_node(root, Context::new()).unwrap();
    let gate_id = wait_for_gate(&handle).await;

    // A fresh subscriber sees what is running now, not what already finished.
    let mut replay = Box::pin(handle.progress());
    let mut frontier = Vec::new();
    for _ in 0..3 {
        frontier.push(replay.next().await.unwrap());
    }
    assert!(matches!(&frontier[0], ProgressEvent::NodeStarted { path, .. } if path == "root"));
    assert!(matches!(&frontier[1], ProgressEvent::NodeStarted { path, .. } if path == "root/1"));
    assert!(matches!(&frontier[2], ProgressEvent::GatePending { name, .. } if name == "publish"));

    engine.resolve_gate(&gate_id, true);
    let rest: Vec<ProgressEvent> = replay.collect().await;
    assert!(matches!(
        rest.last(),
        Some(ProgressEvent::WorkflowFinished {
            status: WorkflowStatus::Completed,
            ..
        })
    ));
    assert!(rest
        .iter()
        .any(|e| matches!(e, ProgressEvent::NodeStarted { path, .. } if path == "root/2")));

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
}

// ─── Plans ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_plan_is_rejected_before_running() {
    let calls = Arc::new(AtomicUsize::new(0));
    let agents = AgentTable::new().with("drafter", counting(&calls));
    let plan = PlanDefinition::new(
        "broken",
        CompositionNode::sequential(vec![leaf("drafter", "draft"), leaf("ghost", "x")]),
    );

    let err = engine(agents).run(&plan, Context::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Plan(_)));
    assert!(err.to_string().contains("root/1"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_yaml_plan_runs_end_to_end() {
    let plan = PlanDefinition::from_yaml(
        r#"
name: review
root:
  kind: sequential
  children:
    - kind: leaf
      agent: drafter
      input: { topic: { from: topic } }
      output_key: draft
    - kind: loop
      max_iterations: 4
      stop_when: { contains: { key: verdict, value: APPROVED } }
      body:
        kind: leaf
        agent: critic
        input: { text: { from: draft } }
        output_key: verdict
"#,
    )
    .unwrap();
    let agents = AgentTable::new()
        .with(
            "drafter",
            agent_fn(|input: Value| async move {
                Ok::<_, AgentFailure>(json!(format!("about {}", input["topic"].as_str().unwrap_or("?"))))
            }),
        )
        .with(
            "critic",
            Arc::new(ScriptedAgent::new(vec![
                ScriptedResponse::ok(json!("REVISE")),
                ScriptedResponse::ok(json!("APPROVED, ship it")),
            ])),
        );

    let result = engine(agents)
        .run(&plan, Context::from_json(json!({ "topic": "rust" })))
        .await
        .unwrap();

    assert_eq!(result.plan.as_deref(), Some("review"));
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.get("draft"), Some(&json!("about rust")));
    assert_eq!(result.node("root/1").unwrap().iterations, Some(2));
}
