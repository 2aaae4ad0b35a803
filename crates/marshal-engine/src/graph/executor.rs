use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use marshal_core::error::{ErrorKind, MarshalError, Result};
use marshal_core::policy::{Policy, RiskLevel};
use marshal_core::types::{
    ActionRequest, ApprovalStatus, EngineEvent, RunId, StateDelta, StateMap, StepNote,
    StepOutcome, StepRecord,
};

use super::compile::{CompiledGraph, JoinMode, ParallelGroup};
use super::node::{Node, RetryPolicy};
use super::route::{Route, END};
use super::state::ExecutionState;
use crate::approval::RUN_CANCELLED;
use crate::governance::GovernanceContext;
use crate::guardrails::PolicySnapshot;
use crate::voting::VotingCoordinator;

/// Per-run limits.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Step ceiling; falls back to `engine.max_steps`.
    pub max_steps: Option<usize>,
    /// Timeout for nodes that do not set their own.
    pub timeout_per_node: Option<Duration>,
    /// Budget periods every action in the run is charged against.
    pub budget_keys: Vec<String>,
}

impl RunOptions {
    pub fn with_max_steps(mut self, n: usize) -> Self {
        self.max_steps = Some(n);
        self
    }

    pub fn with_timeout_per_node(mut self, timeout: Duration) -> Self {
        self.timeout_per_node = Some(timeout);
        self
    }

    pub fn with_budget_keys(mut self, keys: Vec<String>) -> Self {
        self.budget_keys = keys;
        self
    }
}

/// State and trail of a run that reached a terminal node.
#[derive(Debug, Clone, Serialize)]
pub struct FinalState {
    pub run_id: RunId,
    pub graph_id: String,
    pub state: StateMap,
    pub version: u64,
    pub steps: usize,
    pub trail: Vec<StepRecord>,
}

/// Why a run stopped early, with everything recorded up to that point.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub run_id: RunId,
    pub graph_id: String,
    pub kind: ErrorKind,
    pub error: String,
    /// Node or group that failed, if the failure belongs to one.
    pub node: Option<String>,
    pub steps: usize,
    pub trail: Vec<StepRecord>,
    pub last_state: StateMap,
}

impl FailureReport {
    /// Report for a run whose task died without producing an outcome.
    pub fn aborted(run_id: RunId, graph_id: &str, message: String) -> Self {
        Self {
            run_id,
            graph_id: graph_id.to_string(),
            kind: ErrorKind::Internal,
            error: message,
            node: None,
            steps: 0,
            trail: Vec::new(),
            last_state: StateMap::new(),
        }
    }
}

/// Exactly one of these comes back from every run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(FinalState),
    Failed(FailureReport),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Completed(f) => &f.run_id,
            Self::Failed(f) => &f.run_id,
        }
    }

    pub fn trail(&self) -> &[StepRecord] {
        match self {
            Self::Completed(f) => &f.trail,
            Self::Failed(f) => &f.trail,
        }
    }

    /// Final state, or the last state before the failure.
    pub fn state(&self) -> &StateMap {
        match self {
            Self::Completed(f) => &f.state,
            Self::Failed(f) => &f.last_state,
        }
    }

    pub fn into_result(self) -> std::result::Result<FinalState, FailureReport> {
        match self {
            Self::Completed(f) => Ok(f),
            Self::Failed(f) => Err(f),
        }
    }
}

fn outcome_for(e: &MarshalError) -> StepOutcome {
    match e {
        MarshalError::PolicyDenied { .. }
        | MarshalError::BudgetExceeded { .. }
        | MarshalError::CircuitOpen { .. }
        | MarshalError::ApprovalRejected { .. }
        | MarshalError::ApprovalExpired { .. } => StepOutcome::Denied,
        MarshalError::Timeout { .. } => StepOutcome::Timeout,
        _ => StepOutcome::Failed,
    }
}

/// What a node invocation produced, with one record per attempt.
struct Invocation {
    result: Result<StateDelta>,
    records: Vec<StepRecord>,
}

/// Run-wide context shared with branch tasks.
struct RunScope {
    run_id: RunId,
    gov: Arc<GovernanceContext>,
    policies: Arc<PolicySnapshot>,
    cancel: CancellationToken,
    timeout_per_node: Option<Duration>,
    budget_keys: Vec<String>,
}

impl RunScope {
    /// Execute a node through admission, approval, timeout and retries.
    async fn invoke(&self, node: &Node, step: usize, snapshot: &ExecutionState) -> Invocation {
        let retry = node.retry.clone().unwrap_or_else(RetryPolicy::none);
        let policy = node
            .action
            .as_ref()
            .and_then(|a| self.policies.get(&a.action));
        let policy_risk = policy.map(|p| p.risk_level).unwrap_or_default();
        let risk = match node.action.as_ref().and_then(|a| a.risk) {
            Some(hint) => hint.max(policy_risk),
            None => policy_risk,
        };
        let request = node.action.as_ref().map(|a| {
            let mut req = a.to_request(&self.run_id.0, &node.name, snapshot, &self.budget_keys);
            req.risk = risk;
            req
        });

        let mut approved = false;
        let mut records = Vec::new();
        let mut attempt: u32 = 1;
        loop {
            let started_at = Utc::now();
            let clock = Instant::now();
            let mut notes = Vec::new();
            self.gov.event_bus.publish(EngineEvent::NodeStarted {
                run_id: self.run_id.clone(),
                node: node.name.clone(),
                attempt,
            });

            let result = self
                .attempt(node, request.as_ref(), policy, risk, snapshot, &mut approved, &mut notes)
                .await;

            let (outcome, error_kind, error) = match &result {
                Ok(_) => (StepOutcome::Success, None, None),
                Err(e) => (outcome_for(e), Some(e.kind()), Some(e.to_string())),
            };
            records.push(StepRecord {
                step,
                node: node.name.clone(),
                attempt,
                input_version: snapshot.version(),
                output_delta: result.as_ref().ok().cloned(),
                started_at,
                ended_at: Utc::now(),
                outcome,
                error_kind,
                error,
                notes,
            });

            let e = match result {
                Ok(delta) => {
                    let elapsed_ms = clock.elapsed().as_millis() as u64;
                    debug!(node = %node.name, step, attempt, elapsed_ms, "Node complete");
                    self.gov.event_bus.publish(EngineEvent::NodeCompleted {
                        run_id: self.run_id.clone(),
                        node: node.name.clone(),
                        elapsed_ms,
                    });
                    return Invocation {
                        result: Ok(delta),
                        records,
                    };
                }
                Err(e) => e,
            };

            self.gov.event_bus.publish(EngineEvent::NodeFailed {
                run_id: self.run_id.clone(),
                node: node.name.clone(),
                attempt,
                kind: e.kind(),
                error: e.to_string(),
            });

            if !e.is_retryable() || attempt >= retry.max_attempts || self.cancel.is_cancelled() {
                return Invocation {
                    result: Err(e),
                    records,
                };
            }

            let delay = retry.backoff(attempt - 1);
            warn!(
                node = %node.name,
                attempt,
                max_attempts = retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Node failed, retrying"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Invocation {
                        result: Err(MarshalError::Cancelled),
                        records,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        node: &Node,
        request: Option<&ActionRequest>,
        policy: Option<&Policy>,
        risk: RiskLevel,
        snapshot: &ExecutionState,
        approved: &mut bool,
        notes: &mut Vec<StepNote>,
    ) -> Result<StateDelta> {
        if let (Some(req), Some(policy)) = (request, policy) {
            if policy.requires_approval && !*approved {
                self.gov.policy.check(&self.policies, req)?;
                let urgency = node
                    .action
                    .as_ref()
                    .and_then(|a| a.urgency)
                    .unwrap_or(policy.urgency);
                self.await_approval(req, risk, urgency, notes).await?;
                *approved = true;
            }
        }

        // Admit after the approval wait, immediately before the executor runs.
        let admission = match request {
            Some(req) => Some((req, self.gov.policy.admit(&self.policies, req)?)),
            None => None,
        };

        let timeout = node
            .timeout
            .or(self.timeout_per_node)
            .unwrap_or_else(|| risk.default_timeout());
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(MarshalError::Cancelled),
            r = tokio::time::timeout(timeout, node.executor.execute(snapshot.clone())) => match r {
                Ok(r) => r,
                Err(_) => Err(MarshalError::Timeout {
                    node: node.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
        };

        if let Some((req, adm)) = admission {
            match &result {
                Ok(_) => self.gov.breakers.record_success(&req.action, adm),
                Err(MarshalError::Cancelled) => self.gov.breakers.release(&req.action, adm),
                Err(_) => self.gov.breakers.record_failure(&req.action, adm),
            }
            if !matches!(result, Err(MarshalError::Cancelled)) && req.estimated_cost_cents > 0 {
                self.gov
                    .budget
                    .record(req.estimated_cost_cents, &req.budget_keys);
            }
        }
        result
    }

    async fn await_approval(
        &self,
        req: &ActionRequest,
        risk: RiskLevel,
        urgency: marshal_core::policy::Urgency,
        notes: &mut Vec<StepNote>,
    ) -> Result<()> {
        let approvals = &self.gov.approvals;
        let pending = approvals.request_approval(req, risk, urgency).await;
        notes.push(StepNote::ApprovalRequested {
            request_id: pending.id.clone(),
        });
        info!(node = %req.node, action = %req.action, id = %pending.id, "Waiting for approval");

        let resolved = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                approvals.cancel_run(&self.run_id.0).await;
                return Err(MarshalError::Cancelled);
            }
            r = approvals.wait_for_resolution(&pending.id) => r?,
        };

        if resolved.escalation_count > 0 {
            notes.push(StepNote::ApprovalEscalated {
                request_id: resolved.id.clone(),
            });
        }
        notes.push(StepNote::ApprovalResolved {
            request_id: resolved.id.clone(),
            status: resolved.status,
        });

        match resolved.status {
            ApprovalStatus::Expired if resolved.reason.as_deref() == Some(RUN_CANCELLED) => {
                Err(MarshalError::Cancelled)
            }
            ApprovalStatus::Approved => Ok(()),
            ApprovalStatus::Rejected => Err(MarshalError::ApprovalRejected {
                action: req.action.clone(),
                reason: resolved.reason.unwrap_or_default(),
            }),
            _ => Err(MarshalError::ApprovalExpired {
                action: req.action.clone(),
                request_id: resolved.id,
            }),
        }
    }
}

/// Converging routes join: a target already waiting in the frontier runs once.
fn enqueue(frontier: &mut VecDeque<String>, target: String) {
    if !frontier.contains(&target) {
        frontier.push_back(target);
    }
}

/// Mutable bookkeeping of one run, owned by the run's task.
struct Run {
    scope: Arc<RunScope>,
    graph: Arc<CompiledGraph>,
    state: Mutex<ExecutionState>,
    trail: Vec<StepRecord>,
    steps: usize,
    max_steps: usize,
}

impl Run {
    /// Walk the frontier until it empties or a failure is not absorbed.
    async fn drive(&mut self) -> std::result::Result<(), (MarshalError, Option<String>)> {
        let graph = self.graph.clone();
        let mut frontier = VecDeque::from([graph.entry().to_string()]);

        while let Some(target) = frontier.pop_front() {
            if target == END {
                continue;
            }
            if self.scope.cancel.is_cancelled() {
                return Err((MarshalError::Cancelled, Some(target)));
            }

            let (result, mut records) = match graph.group(&target) {
                Some(group) => self.run_group(group).await,
                None => self.run_node(&target).await,
            };
            let result = match result {
                Ok(()) => self.next_targets(&target).await,
                Err(e) => Err(e),
            };

            let outcome = match result {
                Ok(next) => {
                    for t in next {
                        enqueue(&mut frontier, t);
                    }
                    Ok(())
                }
                Err(e) => match graph.fallback_of(&target) {
                    Some(fallback) if e.allows_fallback() => {
                        warn!(
                            node = %target,
                            fallback = %fallback,
                            kind = %e.kind(),
                            error = %e,
                            "Failure absorbed by fallback"
                        );
                        if let Some(last) = records.last_mut() {
                            last.notes.push(StepNote::FallbackTaken {
                                target: fallback.to_string(),
                            });
                        }
                        enqueue(&mut frontier, fallback.to_string());
                        Ok(())
                    }
                    _ => Err((e, Some(target))),
                },
            };

            for record in records {
                self.scope.gov.audit.append_step(&self.scope.run_id.0, record.clone());
                self.trail.push(record);
            }
            outcome?;
        }
        Ok(())
    }

    fn take_steps(&mut self, n: usize) -> Result<usize> {
        if self.steps + n > self.max_steps {
            return Err(MarshalError::LoopLimitExceeded(self.max_steps));
        }
        let first = self.steps + 1;
        self.steps += n;
        Ok(first)
    }

    async fn run_node(&mut self, name: &str) -> (Result<()>, Vec<StepRecord>) {
        let graph = self.graph.clone();
        let Some(node) = graph.node(name) else {
            return (
                Err(MarshalError::GraphDefinition(format!("unknown node '{}'", name))),
                Vec::new(),
            );
        };
        let step = match self.take_steps(1) {
            Ok(s) => s,
            Err(e) => return (Err(e), Vec::new()),
        };

        let snapshot = self.state.lock().await.clone();
        let inv = self.scope.invoke(node, step, &snapshot).await;
        match inv.result {
            Ok(delta) => {
                self.state.lock().await.apply(&delta);
                (Ok(()), inv.records)
            }
            Err(e) => (Err(e), inv.records),
        }
    }

    async fn run_group(&mut self, group: &ParallelGroup) -> (Result<()>, Vec<StepRecord>) {
        let n = group.branches.len();
        let base = match self.take_steps(n) {
            Ok(s) => s,
            Err(e) => return (Err(e), Vec::new()),
        };

        let snapshot = self.state.lock().await.clone();
        let cap = group
            .max_concurrency
            .unwrap_or(self.scope.gov.engine.worker_pool_size)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(cap));
        info!(group = %group.name, branches = n, concurrency = cap, "Fanning out");

        let mut set = JoinSet::new();
        for (idx, branch) in group.branches.iter().enumerate() {
            let Some(node) = self.graph.node(branch).cloned() else {
                continue;
            };
            let scope = self.scope.clone();
            let snapshot = snapshot.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let inv = scope.invoke(&node, base + idx, &snapshot).await;
                (idx, inv)
            });
        }

        let mut slots: Vec<Option<Invocation>> = (0..n).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, inv)) => slots[idx] = Some(inv),
                Err(e) => error!(group = %group.name, error = %e, "Branch task died"),
            }
        }

        let mut records = Vec::new();
        let mut successes: Vec<(String, StateDelta)> = Vec::new();
        let mut failures: Vec<(String, MarshalError)> = Vec::new();
        for (branch, slot) in group.branches.iter().zip(slots) {
            match slot {
                Some(inv) => {
                    records.extend(inv.records);
                    match inv.result {
                        Ok(delta) => successes.push((branch.clone(), delta)),
                        Err(e) => failures.push((branch.clone(), e)),
                    }
                }
                None => failures.push((
                    branch.clone(),
                    MarshalError::NodeExecution {
                        node: branch.clone(),
                        message: "branch task panicked".into(),
                    },
                )),
            }
        }

        if self.scope.cancel.is_cancelled() {
            return (Err(MarshalError::Cancelled), records);
        }

        let failed = match group.join {
            JoinMode::RequireAll => !failures.is_empty(),
            JoinMode::BestEffort => successes.is_empty(),
        };
        if failed && !failures.is_empty() {
            let (branch, e) = failures.remove(0);
            warn!(group = %group.name, branch = %branch, error = %e, "Parallel group failed");
            return (Err(e), records);
        }
        for (branch, e) in &failures {
            warn!(group = %group.name, branch = %branch, error = %e, "Branch failed, continuing");
        }

        let mut decision = StateDelta::new();
        if let Some(vote) = &group.vote {
            let ballots: Result<Vec<_>> = successes
                .iter()
                .filter_map(|(b, d)| d.get(&vote.ballot_key).map(|v| vote.ballot(b, v)))
                .collect();
            let result = ballots.and_then(|b| VotingCoordinator::new(vote.strategy).decide(&b));
            match result {
                Ok(r) => {
                    info!(group = %group.name, outcome = %r.outcome, "Group vote decided");
                    decision.insert(
                        vote.output_key.clone(),
                        serde_json::to_value(r.outcome).unwrap_or(serde_json::Value::Null),
                    );
                }
                Err(e) => return (Err(e), records),
            }
        }

        let deltas: Vec<StateDelta> = successes.into_iter().map(|(_, d)| d).collect();
        let mut state = self.state.lock().await;
        state.merge_parallel(&deltas);
        if !decision.is_empty() {
            state.apply(&decision);
        }
        (Ok(()), records)
    }

    async fn next_targets(&self, name: &str) -> Result<Vec<String>> {
        match self.graph.route_of(name) {
            Route::Direct(t) => Ok(vec![t.clone()]),
            Route::End => Ok(vec![]),
            Route::Conditional { candidates, router } => {
                let picks = {
                    let state = self.state.lock().await;
                    router.route(&state)?
                };
                if let Some(bad) = picks.iter().find(|p| *p != END && !candidates.contains(p)) {
                    return Err(MarshalError::NodeExecution {
                        node: name.to_string(),
                        message: format!("router returned undeclared target '{}'", bad),
                    });
                }
                debug!(node = %name, next = ?picks, "Routed");
                Ok(picks)
            }
        }
    }
}

/// Runs compiled graphs under the governance context.
#[derive(Clone)]
pub struct ExecutionEngine {
    gov: Arc<GovernanceContext>,
}

impl ExecutionEngine {
    pub fn new(gov: Arc<GovernanceContext>) -> Self {
        Self { gov }
    }

    pub fn governance(&self) -> &Arc<GovernanceContext> {
        &self.gov
    }

    /// Run a graph to completion with a fresh run id and the current policy
    /// snapshot.
    pub async fn run(
        &self,
        graph: Arc<CompiledGraph>,
        initial: StateMap,
        options: RunOptions,
    ) -> RunOutcome {
        self.run_with(
            RunId::new(),
            graph,
            initial,
            options,
            self.gov.policy.snapshot(),
            CancellationToken::new(),
        )
        .await
    }

    pub async fn run_with(
        &self,
        run_id: RunId,
        graph: Arc<CompiledGraph>,
        initial: StateMap,
        options: RunOptions,
        policies: Arc<PolicySnapshot>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let max_steps = options.max_steps.unwrap_or(self.gov.engine.max_steps);
        let timeout_per_node = options
            .timeout_per_node
            .or(self.gov.engine.node_timeout_secs.map(Duration::from_secs));
        let scope = Arc::new(RunScope {
            run_id: run_id.clone(),
            gov: self.gov.clone(),
            policies,
            cancel,
            timeout_per_node,
            budget_keys: options.budget_keys,
        });
        let mut run = Run {
            scope,
            state: Mutex::new(ExecutionState::new(graph.schema(), initial)),
            graph: graph.clone(),
            trail: Vec::new(),
            steps: 0,
            max_steps,
        };

        info!(run_id = %run_id, graph = %graph.id, max_steps, "Run started");
        self.gov.event_bus.publish(EngineEvent::RunStarted {
            run_id: run_id.clone(),
            graph_id: graph.id.clone(),
        });

        let result = run.drive().await;
        let state = run.state.lock().await.clone();
        match result {
            Ok(()) => {
                info!(run_id = %run_id, steps = run.steps, "Run completed");
                self.gov.event_bus.publish(EngineEvent::RunCompleted {
                    run_id: run_id.clone(),
                    steps: run.steps,
                });
                RunOutcome::Completed(FinalState {
                    run_id,
                    graph_id: graph.id.clone(),
                    version: state.version(),
                    state: state.into_data(),
                    steps: run.steps,
                    trail: run.trail,
                })
            }
            Err((e, node)) => {
                if matches!(e, MarshalError::Cancelled) {
                    self.gov.approvals.cancel_run(&run_id.0).await;
                }
                error!(
                    run_id = %run_id,
                    node = node.as_deref().unwrap_or("-"),
                    kind = %e.kind(),
                    error = %e,
                    "Run failed"
                );
                self.gov.event_bus.publish(EngineEvent::RunFailed {
                    run_id: run_id.clone(),
                    kind: e.kind(),
                    error: e.to_string(),
                });
                RunOutcome::Failed(FailureReport {
                    run_id,
                    graph_id: graph.id.clone(),
                    kind: e.kind(),
                    error: e.to_string(),
                    node,
                    steps: run.steps,
                    trail: run.trail,
                    last_state: state.into_data(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::graph::compile::GraphBuilder;
    use crate::graph::route::{ExprRouter, FnRouter};
    use crate::graph::state::MergePolicy;
    use marshal_core::config::AppConfig;

    fn engine() -> ExecutionEngine {
        let gov = GovernanceContext::from_config(&AppConfig::default()).unwrap();
        ExecutionEngine::new(Arc::new(gov))
    }

    fn writes(name: &str, key: &'static str, value: serde_json::Value) -> Node {
        Node::from_fn(name, move |_| {
            let value = value.clone();
            async move {
                let mut d = StateDelta::new();
                d.insert(key.to_string(), value);
                Ok(d)
            }
        })
    }

    #[tokio::test]
    async fn linear_graph_completes_within_node_count() {
        let graph = GraphBuilder::new("linear")
            .node(writes("a", "a", json!(1)))
            .node(writes("b", "b", json!(2)))
            .node(writes("c", "c", json!(3)))
            .edge("a", "b")
            .edge("b", "c")
            .entry("a")
            .compile()
            .unwrap();
        let outcome = engine()
            .run(Arc::new(graph), StateMap::new(), RunOptions::default())
            .await;
        let done = outcome.into_result().unwrap();
        assert_eq!(done.steps, 3);
        assert_eq!(done.state["c"], json!(3));
        assert_eq!(done.version, 3);
        let versions: Vec<u64> = done.trail.iter().map(|r| r.input_version).collect();
        assert_eq!(versions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cycle_hits_loop_limit() {
        let graph = GraphBuilder::new("cycle")
            .node(writes("ping", "x", json!("ping")))
            .node(writes("pong", "x", json!("pong")))
            .edge("ping", "pong")
            .edge("pong", "ping")
            .entry("ping")
            .compile()
            .unwrap();
        let outcome = engine()
            .run(
                Arc::new(graph),
                StateMap::new(),
                RunOptions::default().with_max_steps(7),
            )
            .await;
        let report = outcome.into_result().unwrap_err();
        assert_eq!(report.kind, ErrorKind::LoopLimitExceeded);
        assert_eq!(report.steps, 7);
        assert_eq!(report.trail.len(), 7);
    }

    #[tokio::test]
    async fn expr_router_selects_branch() {
        let graph = GraphBuilder::new("route")
            .node(writes("check", "status", json!("broken")))
            .node(writes("fix", "fixed", json!(true)))
            .node(writes("ship", "shipped", json!(true)))
            .route(
                "check",
                Route::expr(ExprRouter::new("ship").when(r#"status == "broken""#, "fix")),
            )
            .entry("check")
            .compile()
            .unwrap();
        let done = engine()
            .run(Arc::new(graph), StateMap::new(), RunOptions::default())
            .await
            .into_result()
            .unwrap();
        assert_eq!(done.state.get("fixed"), Some(&json!(true)));
        assert!(done.state.get("shipped").is_none());
    }

    #[tokio::test]
    async fn converging_routes_run_the_join_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let join = Node::from_fn("d", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(StateDelta::new()) }
        });
        let graph = GraphBuilder::new("diamond")
            .node(writes("a", "a", json!(1)))
            .node(writes("b", "b", json!(2)))
            .node(writes("c", "c", json!(3)))
            .node(join)
            .route(
                "a",
                Route::conditional(
                    vec!["b".into(), "c".into()],
                    Arc::new(FnRouter::new(|_| vec!["b".to_string(), "c".to_string()])),
                ),
            )
            .edge("b", "d")
            .edge("c", "d")
            .entry("a")
            .compile()
            .unwrap();
        let done = engine()
            .run(Arc::new(graph), StateMap::new(), RunOptions::default())
            .await
            .into_result()
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(done.steps, 4);
        let order: Vec<&str> = done.trail.iter().map(|r| r.node.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn undeclared_router_target_fails() {
        let graph = GraphBuilder::new("bad-router")
            .node(writes("a", "x", json!(1)))
            .node(writes("b", "y", json!(1)))
            .route(
                "a",
                Route::conditional(
                    vec!["b".into()],
                    Arc::new(FnRouter::new(|_| vec!["elsewhere".to_string()])),
                ),
            )
            .entry("a")
            .compile()
            .unwrap();
        let report = engine()
            .run(Arc::new(graph), StateMap::new(), RunOptions::default())
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(report.kind, ErrorKind::NodeExecution);
        assert_eq!(report.node.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = Node::from_fn("flaky", move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(MarshalError::NodeExecution {
                        node: "flaky".into(),
                        message: "transient".into(),
                    })
                } else {
                    Ok(StateDelta::new())
                }
            }
        })
        .with_retry(RetryPolicy::new(3).with_backoff(100, 1_000));
        let graph = GraphBuilder::new("retry")
            .node(flaky)
            .entry("flaky")
            .compile()
            .unwrap();
        let done = engine()
            .run(Arc::new(graph), StateMap::new(), RunOptions::default())
            .await
            .into_result()
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(done.steps, 1);
        let attempts: Vec<u32> = done.trail.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(done.trail[0].outcome, StepOutcome::Failed);
        assert_eq!(done.trail[2].outcome, StepOutcome::Success);
    }

    #[tokio::test]
    async fn fallback_absorbs_failure() {
        let broken = Node::from_fn("primary", |_| async {
            Err(MarshalError::NodeExecution {
                node: "primary".into(),
                message: "boom".into(),
            })
        })
        .with_fallback("backup");
        let graph = GraphBuilder::new("fallback")
            .node(broken)
            .node(writes("backup", "via", json!("backup")))
            .edge("primary", END)
            .entry("primary")
            .compile()
            .unwrap();
        let done = engine()
            .run(Arc::new(graph), StateMap::new(), RunOptions::default())
            .await
            .into_result()
            .unwrap();
        assert_eq!(done.state["via"], json!("backup"));
        assert_eq!(done.trail[0].outcome, StepOutcome::Failed);
        assert_eq!(
            done.trail[0].notes,
            vec![StepNote::FallbackTaken {
                target: "backup".into()
            }]
        );
    }

    #[tokio::test]
    async fn unregistered_action_is_denied() {
        let node = writes("deploy", "done", json!(true))
            .with_action(crate::graph::node::ActionSpec::new("deploy_prod"));
        let graph = GraphBuilder::new("deny")
            .node(node)
            .entry("deploy")
            .compile()
            .unwrap();
        let eng = engine();
        let report = eng
            .run(Arc::new(graph), StateMap::new(), RunOptions::default())
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(report.kind, ErrorKind::PolicyDenied);
        assert_eq!(report.trail[0].outcome, StepOutcome::Denied);
        assert!(report.last_state.get("done").is_none());

        use crate::audit::AuditReader;
        let violations = eng.governance().audit.violations_for_run(&report.run_id.0);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].reason, "unregistered_action");
    }

    fn fails(name: &'static str) -> Node {
        Node::from_fn(name, move |_| async move {
            Err(MarshalError::NodeExecution {
                node: name.into(),
                message: format!("{} broke", name),
            })
        })
    }

    #[tokio::test]
    async fn require_all_reports_first_failure_by_priority() {
        let graph = GraphBuilder::new("fan")
            .node(writes("ok", "ok", json!(true)))
            .node(fails("alpha"))
            .node(fails("beta"))
            .group(crate::graph::compile::ParallelGroup::new(
                "fan",
                vec!["ok".into(), "alpha".into(), "beta".into()],
            ))
            .entry("fan")
            .compile()
            .unwrap();
        let report = engine()
            .run(Arc::new(graph), StateMap::new(), RunOptions::default())
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(report.kind, ErrorKind::NodeExecution);
        assert_eq!(report.node.as_deref(), Some("fan"));
        assert!(report.error.contains("alpha broke"));
        assert_eq!(report.trail.len(), 3);
        assert!(report.last_state.get("ok").is_none());
    }

    #[tokio::test]
    async fn parallel_merge_follows_branch_priority() {
        for _ in 0..10 {
            let graph = GraphBuilder::new("fan")
                .node(writes("first", "tags", json!(["b", "a"])))
                .node(writes("second", "tags", json!(["c", "a"])))
                .node(writes("third", "owner", json!("third")))
                .node(writes("fourth", "owner", json!("fourth")))
                .group(
                    crate::graph::compile::ParallelGroup::new(
                        "fan",
                        vec!["first".into(), "second".into(), "third".into(), "fourth".into()],
                    )
                    .with_max_concurrency(2),
                )
                .merge_policy("tags", MergePolicy::AccumulateSet)
                .entry("fan")
                .compile()
                .unwrap();
            let done = engine()
                .run(Arc::new(graph), StateMap::new(), RunOptions::default())
                .await
                .into_result()
                .unwrap();
            assert_eq!(done.state["tags"], json!(["b", "a", "c"]));
            assert_eq!(done.state["owner"], json!("third"));
            assert_eq!(done.steps, 4);
            assert_eq!(done.version, 1);
        }
    }
}
