//! End-to-end tests for the flow engine: DSL text in, boolean result and
//! trace out.
//!
//! Node bodies are `MockNode` doubles (scripted outcomes + shared call log)
//! or small closures where the test needs to touch state. Timing tests run
//! on tokio's paused clock so sleeps and deadlines are deterministic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::time::Instant;

use nodes::mock::{CallLog, MockBehaviour, MockNode};
use nodes::{ExecutableNode, Node, NodeError, Registry, State, StateConfig};

use crate::expr::{loop_until, Expr};
use crate::{EngineError, Flow, ParseError};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A flow over a fresh registry holding `nodes`.
fn flow_with(nodes: Vec<Node>) -> Flow {
    init_tracing();
    let registry = Registry::new();
    for node in nodes {
        registry.register(node).expect("unique node names");
    }
    Flow::new(Arc::new(registry))
}

fn mock(name: &str, result: bool, log: &CallLog) -> Node {
    MockNode::returning(name, result).recording_into(log).into_node()
}

fn statuses(state: &State) -> Vec<String> {
    state
        .events()
        .iter()
        .map(|event| {
            let mut parts = event.splitn(3, ':');
            let name = parts.next().unwrap_or_default();
            let status = parts.next().unwrap_or_default();
            format!("{name}:{status}")
        })
        .collect()
}

// ============================================================
// Scenarios
// ============================================================

struct Process;

#[async_trait]
impl ExecutableNode for Process {
    async fn execute(&self, state: &State) -> Result<bool, NodeError> {
        let data = state.get_or("data", Value::Null).await;
        let value = data["value"]
            .as_i64()
            .ok_or_else(|| NodeError::failed("MissingData", "data.value is not set"))?;
        state.set("result", value * 2).await?;
        Ok(true)
    }
}

#[tokio::test]
async fn fetch_then_process_passes_data_through_state() {
    let fetch = Node::from_fn("fetch", |state| {
        async move {
            state.set("data", json!({ "value": 42 })).await?;
            Ok::<_, NodeError>(true)
        }
        .boxed()
    });
    let flow = flow_with(vec![fetch, Node::new("process", Process)]);
    let state = State::new();

    let result = flow.run("fetch >> process", &state).await.unwrap();

    assert!(result);
    assert_eq!(state.get("result").await, Some(json!(84)));
    assert_eq!(statuses(&state), vec!["fetch:OK", "process:OK"]);
}

#[tokio::test(start_paused = true)]
async fn parallel_branches_overlap_in_time() {
    let log = CallLog::new();
    let flow = flow_with(vec![
        MockNode::sleeping("api1", Duration::from_millis(300), true)
            .recording_into(&log)
            .into_node(),
        MockNode::sleeping("api2", Duration::from_millis(300), true)
            .recording_into(&log)
            .into_node(),
    ]);
    let state = State::new();

    let started = Instant::now();
    let result = flow.run("api1 & api2", &state).await.unwrap();
    let elapsed = started.elapsed();

    assert!(result);
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(450), "took {elapsed:?}, expected ~300ms");
    assert_eq!(log.len(), 2);
    assert_eq!(state.trace_len(), 2);
}

#[tokio::test]
async fn failed_validation_skips_process() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("validate", false, &log), mock("process", true, &log)]);
    let state = State::new();

    let result = flow.run("validate ? process", &state).await.unwrap();

    assert!(!result);
    assert_eq!(log.order(), vec!["validate"]);
    assert_eq!(statuses(&state), vec!["validate:OK"]);
}

#[tokio::test]
async fn loop_gives_up_after_max_iterations() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("generator", true, &log), mock("reviewer", false, &log)]);
    let state = State::new();

    let result = flow.run("generator <2> reviewer", &state).await.unwrap();

    assert!(!result);
    assert_eq!(
        log.order(),
        vec!["generator", "reviewer", "generator", "reviewer"]
    );
    assert_eq!(state.trace_len(), 4);
}

#[tokio::test]
async fn unknown_node_with_empty_registry() {
    let flow = flow_with(vec![]);
    let state = State::new();

    match flow.run("nonexistent", &state).await {
        Err(EngineError::UnknownNode { name, registered }) => {
            assert_eq!(name, "nonexistent");
            assert!(registered.is_empty());
        }
        other => panic!("expected unknown node error, got {other:?}"),
    }
    assert_eq!(state.trace_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_resolves_to_false_and_is_traced() {
    let slow = MockNode::sleeping("slow", Duration::from_secs(1), true)
        .into_node()
        .with_timeout(Duration::from_millis(10));
    let flow = flow_with(vec![slow]);
    let state = State::new();

    let result = flow.run("slow", &state).await;

    assert!(!result.expect("timeouts never propagate"));
    assert_eq!(statuses(&state), vec!["slow:TIMEOUT"]);
}

// ============================================================
// Operator semantics
// ============================================================

#[tokio::test]
async fn sequence_runs_right_even_when_left_fails() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("a", false, &log), mock("b", true, &log)]);
    let state = State::new();

    assert!(flow.run("a >> b", &state).await.unwrap());
    assert_eq!(log.order(), vec!["a", "b"]);

    let flow = flow_with(vec![mock("a", true, &log), mock("b", false, &log)]);
    assert!(!flow.run("a >> b", &State::new()).await.unwrap());
}

#[tokio::test]
async fn sequence_stops_when_left_errors() {
    let log = CallLog::new();
    let flow = flow_with(vec![
        MockNode::failing("boom", "Upstream", "503").recording_into(&log).into_node(),
        mock("after", true, &log),
    ]);
    let state = State::new();

    let err = flow.run("boom >> after", &state).await.unwrap_err();

    match err {
        EngineError::Execution(err) => {
            assert_eq!(err.node, "boom");
            assert_eq!(err.kind(), "Upstream");
        }
        other => panic!("expected execution error, got {other:?}"),
    }
    assert_eq!(log.order(), vec!["boom"]);
    assert_eq!(statuses(&state), vec!["boom:ERR(Upstream)"]);
}

#[tokio::test]
async fn parallel_result_is_logical_and() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("yes", true, &log), mock("no", false, &log)]);

    assert!(flow.run("yes & yes", &State::new()).await.unwrap());
    assert!(!flow.run("yes & no", &State::new()).await.unwrap());
    assert!(!flow.run("no & yes", &State::new()).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn parallel_error_does_not_cancel_sibling() {
    let log = CallLog::new();
    let flow = flow_with(vec![
        MockNode::failing("boom", "Upstream", "503").recording_into(&log).into_node(),
        MockNode::sleeping("slow", Duration::from_millis(200), true)
            .recording_into(&log)
            .into_node(),
    ]);
    let state = State::new();

    let err = flow.run("boom & slow", &state).await.unwrap_err();

    assert!(matches!(err, EngineError::Execution(ref e) if e.node == "boom"));
    let mut seen = statuses(&state);
    seen.sort();
    assert_eq!(seen, vec!["boom:ERR(Upstream)", "slow:OK"]);
}

#[tokio::test(start_paused = true)]
async fn timeout_in_parallel_branch_does_not_cancel_sibling() {
    let log = CallLog::new();
    let flow = flow_with(vec![
        MockNode::sleeping("slow_timeout", Duration::from_secs(1), true)
            .recording_into(&log)
            .into_node()
            .with_timeout(Duration::from_millis(10)),
        MockNode::sleeping("fast_ok", Duration::from_millis(50), true)
            .recording_into(&log)
            .into_node(),
    ]);
    let state = State::new();
    let started = Instant::now();

    let result = flow.run("slow_timeout & fast_ok", &state).await;

    assert!(!result.unwrap());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(log.count("fast_ok"), 1);
    let mut seen = statuses(&state);
    seen.sort();
    assert_eq!(seen, vec!["fast_ok:OK", "slow_timeout:TIMEOUT"]);
}

#[tokio::test]
async fn parallel_chain_joins_every_branch_and_reports_leftmost_error() {
    let log = CallLog::new();
    let flow = flow_with(vec![
        mock("ok", true, &log),
        MockNode::failing("first_bad", "Upstream", "503").recording_into(&log).into_node(),
        MockNode::failing("second_bad", "Upstream", "504").recording_into(&log).into_node(),
    ]);
    let state = State::new();

    let err = flow.run("ok & (first_bad & ok) & second_bad", &state).await.unwrap_err();

    assert!(matches!(err, EngineError::Execution(ref e) if e.node == "first_bad"));
    assert_eq!(log.count("ok"), 2);
    assert_eq!(log.count("second_bad"), 1);
}

#[tokio::test]
async fn on_failure_skips_fallback_when_condition_holds() {
    let log = CallLog::new();
    let flow = flow_with(vec![
        mock("ok", true, &log),
        mock("bad", false, &log),
        mock("fallback", false, &log),
    ]);

    let state = State::new();
    assert!(flow.run("ok | fallback", &state).await.unwrap());
    assert_eq!(log.count("fallback"), 0);
    assert_eq!(statuses(&state), vec!["ok:OK"]);

    let state = State::new();
    assert!(!flow.run("bad | fallback", &state).await.unwrap());
    assert_eq!(log.count("fallback"), 1);
}

#[tokio::test]
async fn on_success_returns_right_result() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("ok", true, &log), mock("no", false, &log)]);

    assert!(!flow.run("ok ? no", &State::new()).await.unwrap());
    assert!(flow.run("ok ? ok", &State::new()).await.unwrap());
}

#[tokio::test]
async fn loop_runs_exactly_n_rounds_when_never_satisfied() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("a", true, &log), mock("b", false, &log)]);

    assert!(!flow.run("a <3> b", &State::new()).await.unwrap());
    assert_eq!(log.count("a"), 3);
    assert_eq!(log.count("b"), 3);
}

#[tokio::test]
async fn loop_stops_as_soon_as_condition_holds() {
    let log = CallLog::new();
    let until = MockNode::scripted(
        "b",
        vec![MockBehaviour::Return(false), MockBehaviour::Return(true)],
    )
    .recording_into(&log)
    .into_node();
    let flow = flow_with(vec![mock("a", true, &log), until]);

    assert!(flow.run("a <3> b", &State::new()).await.unwrap());
    assert_eq!(log.order(), vec!["a", "b", "a", "b"]);
}

#[tokio::test]
async fn loop_reruns_body_even_when_it_fails() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("draft", false, &log), mock("check", false, &log)]);

    assert!(!flow.run("draft <2> check", &State::new()).await.unwrap());
    assert_eq!(log.order(), vec!["draft", "check", "draft", "check"]);
}

#[tokio::test]
async fn quickstart_branching_flow() {
    let log = CallLog::new();
    let flow = flow_with(vec![
        mock("fetch_data", true, &log),
        mock("validate_data", false, &log),
        mock("process_data", true, &log),
        MockNode::returning("handle_error", true)
            .writing("result", json!({ "error": "Invalid data" }))
            .recording_into(&log)
            .into_node(),
    ]);
    let state = State::new();

    let result = flow
        .run("fetch_data >> (validate_data ? process_data | handle_error)", &state)
        .await
        .unwrap();

    assert!(result);
    assert_eq!(log.order(), vec!["fetch_data", "validate_data", "handle_error"]);
    assert_eq!(state.get("result").await, Some(json!({ "error": "Invalid data" })));
}

#[tokio::test(start_paused = true)]
async fn fan_out_then_combine() {
    let log = CallLog::new();
    let combine = Node::from_fn("combine_results", |state| {
        async move {
            let user = state.get_or("user", Value::Null).await;
            let products = state.get_or("products", Value::Null).await;
            state.set("result", json!({ "user": user, "products": products })).await?;
            Ok::<_, NodeError>(true)
        }
        .boxed()
    });
    let flow = flow_with(vec![
        MockNode::sleeping("fetch_user_data", Duration::from_millis(300), true)
            .writing("user", json!({ "id": 123 }))
            .recording_into(&log)
            .into_node(),
        MockNode::sleeping("fetch_product_data", Duration::from_millis(300), true)
            .writing("products", json!([{ "id": 1 }]))
            .recording_into(&log)
            .into_node(),
        combine,
    ]);
    let state = State::with_config(StateConfig {
        thread_safe: true,
        trace_id: Some("parallel-demo".into()),
        ..StateConfig::default()
    });

    let started = Instant::now();
    assert!(flow
        .run("(fetch_user_data & fetch_product_data) >> combine_results", &state)
        .await
        .unwrap());

    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(
        state.get("result").await,
        Some(json!({ "user": { "id": 123 }, "products": [{ "id": 1 }] }))
    );
    assert_eq!(state.events().last().map(|e| e.starts_with("combine_results:OK:")), Some(true));
}

// ============================================================
// Errors, retries, trace bounds
// ============================================================

#[tokio::test]
async fn retried_node_recovers_inside_a_flow() {
    let log = CallLog::new();
    let flaky = MockNode::scripted(
        "flaky",
        vec![
            MockBehaviour::Fail("Io".into(), "reset".into()),
            MockBehaviour::Return(true),
        ],
    )
    .recording_into(&log)
    .into_node()
    .with_retries(2);
    let flow = flow_with(vec![flaky, mock("next", true, &log)]);
    let state = State::new();

    assert!(flow.run("flaky ? next", &state).await.unwrap());
    assert_eq!(statuses(&state), vec!["flaky:ERR(Io)", "flaky:OK", "next:OK"]);
}

#[tokio::test]
async fn anyhow_errors_surface_as_other_kind() {
    let failing = Node::from_fn("quota", |_state| {
        async move {
            let _quota = "not a number".parse::<u32>().map_err(anyhow::Error::from)?;
            Ok::<_, NodeError>(true)
        }
        .boxed()
    });
    let flow = flow_with(vec![failing]);
    let state = State::new();

    let err = flow.run("quota", &state).await.unwrap_err();

    assert!(matches!(err, EngineError::Execution(ref e) if e.kind() == "Other"));
    assert_eq!(statuses(&state), vec!["quota:ERR(Other)"]);
}

#[tokio::test]
async fn trace_stays_bounded_across_a_long_run() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("a", true, &log), mock("b", false, &log)]);
    let state = State::with_config(StateConfig {
        max_trace: 3,
        ..StateConfig::default()
    });
    state.log("run-start", None);

    assert!(!flow.run("a <5> b", &state).await.unwrap());

    assert_eq!(log.len(), 10);
    assert_eq!(state.trace_len(), 3);
    assert_eq!(statuses(&state), vec!["b:OK", "a:OK", "b:OK"]);
}

#[tokio::test]
async fn parse_errors_fail_before_any_node_runs() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("a", true, &log)]);
    let state = State::new();

    let err = flow.run("a >> ((a", &state).await.unwrap_err();

    match &err {
        EngineError::Parse(ParseError::UnmatchedOpen { .. }) => {}
        other => panic!("expected unmatched open, got {other:?}"),
    }
    assert!(err.to_string().contains("unmatched opening parenthesis"));
    assert!(log.is_empty());
    assert_eq!(flow.cached_len(), 0);
}

// ============================================================
// Cache
// ============================================================

#[tokio::test]
async fn compiled_trees_are_cached_and_runs_stay_independent() {
    let log = CallLog::new();
    let counter = Node::from_fn("count", |state| {
        async move {
            let seen = state.get("seen").await.and_then(|v| v.as_i64()).unwrap_or(0);
            state.set("seen", seen + 1).await?;
            Ok::<_, NodeError>(true)
        }
        .boxed()
    });
    let flow = flow_with(vec![counter, mock("done", true, &log)]);

    let first = flow.compile("count >> done").unwrap();
    let second = flow.compile("count >> done").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(flow.cached_len(), 1);

    let run_a = State::new();
    let run_b = State::new();
    assert!(flow.run("count >> done", &run_a).await.unwrap());
    assert!(flow.run("count >> done", &run_b).await.unwrap());

    assert_eq!(run_a.get("seen").await, Some(json!(1)));
    assert_eq!(run_b.get("seen").await, Some(json!(1)));
    assert_eq!(run_a.trace_len(), 2);
    assert_eq!(run_b.trace_len(), 2);
    assert_eq!(flow.cached_len(), 1);

    // Whitespace differences are distinct cache keys but equal trees.
    let spaced = flow.compile("count>>done").unwrap();
    assert_eq!(*spaced, *first);
    assert_eq!(flow.cached_len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_flow_serves_concurrent_runs() {
    let log = CallLog::new();
    let flow = Arc::new(flow_with(vec![
        MockNode::sleeping("work", Duration::from_millis(20), true)
            .recording_into(&log)
            .into_node(),
    ]));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let flow = Arc::clone(&flow);
        handles.push(tokio::spawn(async move {
            let state = State::new();
            let result = flow.run("work & work", &state).await;
            (result, state.trace_len())
        }));
    }
    for handle in handles {
        let (result, trace_len) = handle.await.unwrap();
        assert!(result.unwrap());
        assert_eq!(trace_len, 2);
    }

    assert_eq!(log.len(), 16);
    assert_eq!(flow.cached_len(), 1);
}

#[tokio::test]
async fn builder_trees_run_without_the_cache() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("gen", true, &log), mock("review", true, &log)]);
    let registry = flow.registry();
    let draft = Expr::leaf(registry.resolve("gen").unwrap());
    let review = Expr::leaf(registry.resolve("review").unwrap());

    let expr = loop_until(draft.clone(), review.clone(), std::num::NonZeroU32::MIN) >> (draft ^ review);
    let state = State::new();

    assert!(flow.run_expr(&expr, &state).await.unwrap());
    assert_eq!(log.order(), vec!["gen", "review", "gen", "review"]);
    assert_eq!(flow.cached_len(), 0);

    // The rendered text compiles to the same tree.
    assert_eq!(*flow.compile(&expr.to_string()).unwrap(), expr);
}

// ============================================================
// Long and deep expressions
// ============================================================

#[tokio::test]
async fn long_sequence_chain_runs_without_deep_recursion() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("step", true, &log)]);
    let text = vec!["step"; 2000].join(" >> ");

    assert!(flow.run(&text, &State::new()).await.unwrap());
    assert_eq!(log.count("step"), 2000);
}

#[tokio::test]
async fn long_conditional_chain_keeps_short_circuit_semantics() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("yes", true, &log), mock("no", false, &log)]);
    // no ? yes -> false, | yes -> true, repeated.
    let text = format!("no{}", " ? yes | yes".repeat(1000));

    assert!(flow.run(&text, &State::new()).await.unwrap());
    assert_eq!(log.count("no"), 1);
    assert_eq!(log.count("yes"), 1000);
}

#[tokio::test]
async fn long_parallel_chain_runs_every_branch() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("yes", true, &log), mock("no", false, &log)]);

    let text = vec!["yes"; 500].join(" & ");
    assert!(flow.run(&text, &State::new()).await.unwrap());
    assert_eq!(log.count("yes"), 500);

    let text = format!("{} & no", text);
    assert!(!flow.run(&text, &State::new()).await.unwrap());
    assert_eq!(log.count("no"), 1);
}

#[tokio::test]
async fn excessive_nesting_is_a_parse_error() {
    let log = CallLog::new();
    let flow = flow_with(vec![mock("a", true, &log)]);
    let text = format!("{}a{}", "(".repeat(1000), ")".repeat(1000));

    let err = flow.run(&text, &State::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Parse(ParseError::TooDeep { .. })));
    assert!(log.is_empty());
}
