use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use marshal_core::error::ErrorKind;
use marshal_core::policy::PolicyTable;
use marshal_core::types::{ApprovalStatus, StateMap, StepNote, StepOutcome};
use marshal_engine::graph::{
    ActionSpec, ExecutionEngine, GraphBuilder, Node, ParallelGroup, RunOptions, END,
};
use marshal_engine::voting::{VoteSpec, VotingStrategy};
use marshal_engine::{AuditReader, CircuitState, Orchestrator};
use marshal_test_utils::{
    delta, governance, spawn_approver, CollectingSink, FlakyExecutor, SleepExecutor,
    StaticExecutor, Verdict,
};

#[tokio::test(start_paused = true)]
async fn approval_gated_step_completes_after_auto_approval() {
    let gov = governance(
        r#"
[policies.deploy]
risk_level = "high"
requires_approval = true
"#,
    );
    let sink = Arc::new(CollectingSink::default());
    gov.event_bus.register_sink(sink.clone());
    let _approver = spawn_approver(&gov, Duration::from_secs(1), Verdict::Approve);

    let graph = GraphBuilder::new("release")
        .node(Node::new("a", StaticExecutor::new(delta(&[("built", json!(true))]))))
        .node(
            Node::new("b", StaticExecutor::new(delta(&[("deployed", json!("v1"))])))
                .with_action(ActionSpec::new("deploy")),
        )
        .edge("a", "b")
        .edge("b", END)
        .entry("a")
        .compile()
        .unwrap();

    let done = ExecutionEngine::new(gov.clone())
        .run(Arc::new(graph), StateMap::new(), RunOptions::default())
        .await
        .into_result()
        .unwrap();

    assert_eq!(done.state["deployed"], json!("v1"));
    assert_eq!(done.steps, 2);
    let b = done.trail.iter().find(|r| r.node == "b").unwrap();
    assert_eq!(b.outcome, StepOutcome::Success);
    assert_eq!(b.notes.len(), 2);
    assert!(matches!(b.notes[0], StepNote::ApprovalRequested { .. }));
    assert!(matches!(
        b.notes[1],
        StepNote::ApprovalResolved {
            status: ApprovalStatus::Approved,
            ..
        }
    ));

    let names = sink.names();
    let requested = names.iter().position(|n| *n == "approval_requested").unwrap();
    let resolved = names.iter().position(|n| *n == "approval_resolved").unwrap();
    assert!(requested < resolved);
    assert_eq!(names.first(), Some(&"run_started"));
    assert_eq!(names.last(), Some(&"run_completed"));
}

#[tokio::test(start_paused = true)]
async fn rejected_approval_fails_the_run() {
    let gov = governance(
        r#"
[policies.deploy]
requires_approval = true
"#,
    );
    let _approver = spawn_approver(&gov, Duration::from_millis(10), Verdict::Reject);
    let exec = StaticExecutor::new(delta(&[("deployed", json!(true))]));
    let graph = GraphBuilder::new("release")
        .node(Node::new("deploy", exec.clone()).with_action(ActionSpec::new("deploy")))
        .entry("deploy")
        .compile()
        .unwrap();

    let report = ExecutionEngine::new(gov)
        .run(Arc::new(graph), StateMap::new(), RunOptions::default())
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(report.kind, ErrorKind::ApprovalRejected);
    assert_eq!(report.trail[0].outcome, StepOutcome::Denied);
    assert_eq!(exec.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn fan_out_with_timed_out_branch_fails_group() {
    let gov = governance("");
    let graph = GraphBuilder::new("fan")
        .node(Node::new("one", StaticExecutor::new(delta(&[("one", json!(1))]))))
        .node(
            Node::new(
                "two",
                SleepExecutor::new(Duration::from_secs(30), delta(&[("two", json!(2))])),
            )
            .with_timeout(Duration::from_secs(10)),
        )
        .node(Node::new("three", StaticExecutor::new(delta(&[("three", json!(3))]))))
        .group(ParallelGroup::new(
            "fan",
            vec!["one".into(), "two".into(), "three".into()],
        ))
        .entry("fan")
        .compile()
        .unwrap();

    let report = ExecutionEngine::new(gov)
        .run(Arc::new(graph), StateMap::new(), RunOptions::default())
        .await
        .into_result()
        .unwrap_err();

    assert_eq!(report.kind, ErrorKind::Timeout);
    assert_eq!(report.node.as_deref(), Some("fan"));
    let outcomes: Vec<(&str, StepOutcome)> = report
        .trail
        .iter()
        .map(|r| (r.node.as_str(), r.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("one", StepOutcome::Success),
            ("two", StepOutcome::Timeout),
            ("three", StepOutcome::Success),
        ]
    );
    assert!(report.last_state.is_empty());
}

#[tokio::test]
async fn best_effort_group_merges_survivors_and_votes() {
    let gov = governance("");
    let graph = GraphBuilder::new("review")
        .node(Node::new(
            "security",
            StaticExecutor::new(delta(&[("verdict", json!("approve"))])),
        ))
        .node(Node::new("style", FlakyExecutor::always("style")))
        .node(Node::new(
            "tests",
            StaticExecutor::new(delta(&[("verdict", json!("request_changes"))])),
        ))
        .node(Node::new("ship", StaticExecutor::new(delta(&[("shipped", json!(true))]))))
        .group(
            ParallelGroup::new(
                "reviewers",
                vec!["security".into(), "style".into(), "tests".into()],
            )
            .best_effort()
            .with_vote(
                VoteSpec::new(VotingStrategy::Weighted, "verdict", "decision")
                    .with_weight("security", 2.0),
            )
            .then(marshal_engine::Route::to("ship")),
        )
        .entry("reviewers")
        .compile()
        .unwrap();

    let done = ExecutionEngine::new(gov)
        .run(Arc::new(graph), StateMap::new(), RunOptions::default())
        .await
        .into_result()
        .unwrap();
    assert_eq!(done.state["decision"], json!("approve"));
    assert_eq!(done.state["verdict"], json!("approve"));
    assert_eq!(done.state["shipped"], json!(true));
    assert_eq!(done.steps, 4);
}

#[tokio::test]
async fn veto_overrides_majority() {
    let gov = governance("");
    let graph = GraphBuilder::new("vote")
        .node(Node::new("a", StaticExecutor::new(delta(&[("v", json!("approve"))]))))
        .node(Node::new("b", StaticExecutor::new(delta(&[("v", json!("approve"))]))))
        .node(Node::new("legal", StaticExecutor::new(delta(&[("v", json!("reject"))]))))
        .group(
            ParallelGroup::new("panel", vec!["a".into(), "b".into(), "legal".into()])
                .with_vote(VoteSpec::new(VotingStrategy::Veto, "v", "decision").with_vetoer("legal")),
        )
        .entry("panel")
        .compile()
        .unwrap();

    let done = ExecutionEngine::new(gov)
        .run(Arc::new(graph), StateMap::new(), RunOptions::default())
        .await
        .into_result()
        .unwrap();
    assert_eq!(done.state["decision"], json!("reject"));
}

#[tokio::test]
async fn budget_denies_the_step_that_would_overspend() {
    let gov = governance(
        r#"
[[budget.periods]]
key = "daily"
window = "day"
limit_cents = 100

[policies.http_call]
"#,
    );
    let spec = ActionSpec::new("http_call").with_cost(60);
    let graph = GraphBuilder::new("spend")
        .node(
            Node::new("first", StaticExecutor::new(delta(&[("first", json!(true))])))
                .with_action(spec.clone()),
        )
        .node(
            Node::new("second", StaticExecutor::new(delta(&[("second", json!(true))])))
                .with_action(spec),
        )
        .edge("first", "second")
        .entry("first")
        .compile()
        .unwrap();

    let report = ExecutionEngine::new(gov.clone())
        .run(
            Arc::new(graph),
            StateMap::new(),
            RunOptions::default().with_budget_keys(vec!["daily".into()]),
        )
        .await
        .into_result()
        .unwrap_err();

    assert_eq!(report.kind, ErrorKind::BudgetExceeded);
    assert_eq!(report.node.as_deref(), Some("second"));
    assert_eq!(report.last_state["first"], json!(true));
    assert_eq!(gov.budget.check_budget("daily").unwrap().consumed, 60);

    let violations = gov.audit.violations_for_run(&report.run_id.0);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].reason, "budget_exceeded");
    assert_eq!(gov.audit.steps_for_run(&report.run_id.0).len(), 2);
}

#[tokio::test]
async fn breaker_opens_across_runs() {
    let gov = governance(
        r#"
[breaker.actions.flaky_api]
threshold = 2
cooldown_secs = 60

[policies.flaky_api]
"#,
    );
    let sink = Arc::new(CollectingSink::default());
    gov.event_bus.register_sink(sink.clone());

    let exec = FlakyExecutor::always("call");
    let graph = Arc::new(
        GraphBuilder::new("calls")
            .node(Node::new("call", exec.clone()).with_action(ActionSpec::new("flaky_api")))
            .entry("call")
            .compile()
            .unwrap(),
    );
    let engine = ExecutionEngine::new(gov.clone());

    for _ in 0..2 {
        let report = engine
            .run(graph.clone(), StateMap::new(), RunOptions::default())
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(report.kind, ErrorKind::NodeExecution);
    }
    assert_eq!(gov.breakers.snapshot("flaky_api").state, CircuitState::Open);

    let report = engine
        .run(graph.clone(), StateMap::new(), RunOptions::default())
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(report.kind, ErrorKind::CircuitOpen);
    assert_eq!(exec.calls(), 2);
    assert!(sink.names().contains(&"circuit_opened"));
}

#[tokio::test(start_paused = true)]
async fn cancel_expires_pending_approval() {
    let gov = governance(
        r#"
[policies.deploy]
requires_approval = true
"#,
    );
    let orch = Orchestrator::new(gov.clone());
    orch.register_graph(
        "release",
        GraphBuilder::new("release")
            .node(
                Node::new("deploy", StaticExecutor::new(delta(&[("deployed", json!(true))])))
                    .with_action(ActionSpec::new("deploy")),
            )
            .entry("deploy")
            .compile()
            .unwrap(),
    );

    let handle = orch
        .submit_run("release", StateMap::new(), RunOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(gov.approvals.pending_requests().await.len(), 1);

    handle.cancel().await;
    let report = handle.await_result().await.into_result().unwrap_err();
    assert_eq!(report.kind, ErrorKind::Cancelled);

    let request_id = match &report.trail[0].notes[0] {
        StepNote::ApprovalRequested { request_id } => request_id.clone(),
        other => panic!("unexpected note {:?}", other),
    };
    let request = gov.approvals.get(&request_id).await.unwrap();
    assert_eq!(request.status, ApprovalStatus::Expired);
    assert_eq!(request.reason.as_deref(), Some("run_cancelled"));
    assert!(gov.approvals.pending_requests().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_approval_skips_fallback() {
    let gov = governance(
        r#"
[policies.deploy]
requires_approval = true
"#,
    );
    let rollback = StaticExecutor::new(delta(&[("rolled_back", json!(true))]));
    let orch = Orchestrator::new(gov.clone());
    orch.register_graph(
        "release",
        GraphBuilder::new("release")
            .node(
                Node::new("deploy", StaticExecutor::new(delta(&[("deployed", json!(true))])))
                    .with_action(ActionSpec::new("deploy"))
                    .with_fallback("rollback"),
            )
            .node(Node::new("rollback", rollback.clone()))
            .entry("deploy")
            .compile()
            .unwrap(),
    );

    for _ in 0..5 {
        let handle = orch
            .submit_run("release", StateMap::new(), RunOptions::default())
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel().await;
        let report = handle.await_result().await.into_result().unwrap_err();
        assert_eq!(report.kind, ErrorKind::Cancelled);
        assert_eq!(report.node.as_deref(), Some("deploy"));
    }
    assert_eq!(rollback.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn circuit_opened_during_approval_blocks_execution() {
    let gov = governance(
        r#"
[breaker]
threshold = 2

[policies.deploy]
requires_approval = true
"#,
    );
    let exec = StaticExecutor::new(delta(&[("deployed", json!(true))]));
    let orch = Orchestrator::new(gov.clone());
    orch.register_graph(
        "release",
        GraphBuilder::new("release")
            .node(Node::new("deploy", exec.clone()).with_action(ActionSpec::new("deploy")))
            .entry("deploy")
            .compile()
            .unwrap(),
    );

    let handle = orch
        .submit_run("release", StateMap::new(), RunOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let pending = gov.approvals.pending_requests().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(gov.breakers.snapshot("deploy").state, CircuitState::Closed);

    for _ in 0..2 {
        let admission = gov.breakers.acquire("deploy").unwrap();
        gov.breakers.record_failure("deploy", admission);
    }
    assert_eq!(gov.breakers.snapshot("deploy").state, CircuitState::Open);
    gov.approvals.approve(&pending[0].id, "oncall").await.unwrap();

    let report = handle.await_result().await.into_result().unwrap_err();
    assert_eq!(report.kind, ErrorKind::CircuitOpen);
    assert_eq!(report.trail[0].outcome, StepOutcome::Denied);
    assert_eq!(exec.calls(), 0);
    assert_eq!(gov.breakers.snapshot("deploy").failure_count, 2);
}

#[tokio::test(start_paused = true)]
async fn running_jobs_keep_their_policy_snapshot() {
    let gov = governance(
        r#"
[policies.notify]
"#,
    );
    let orch = Orchestrator::new(gov.clone());
    orch.register_graph(
        "slow",
        GraphBuilder::new("slow")
            .node(Node::new(
                "wait",
                SleepExecutor::new(Duration::from_secs(5), delta(&[])),
            ))
            .node(
                Node::new("notify", StaticExecutor::new(delta(&[("sent", json!(true))])))
                    .with_action(ActionSpec::new("notify")),
            )
            .edge("wait", "notify")
            .entry("wait")
            .compile()
            .unwrap(),
    );

    let handle = orch
        .submit_run("slow", StateMap::new(), RunOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    gov.policy.swap(PolicyTable::new());

    let done = handle.await_result().await.into_result().unwrap();
    assert_eq!(done.state["sent"], json!(true));

    let report = orch
        .submit_run("slow", StateMap::new(), RunOptions::default())
        .unwrap()
        .await_result()
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(report.kind, ErrorKind::PolicyDenied);
}
