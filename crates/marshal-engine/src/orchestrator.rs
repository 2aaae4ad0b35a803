use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use marshal_core::error::{MarshalError, Result};
use marshal_core::types::{RunId, StateMap};

use crate::approval::ApprovalCoordinator;
use crate::governance::GovernanceContext;
use crate::graph::{CompiledGraph, ExecutionEngine, FailureReport, RunOptions, RunOutcome};

/// Registry of compiled graphs that launches runs as background tasks.
///
/// Each run captures the policy snapshot current at submission; swaps made
/// while it executes apply only to later runs.
pub struct Orchestrator {
    engine: ExecutionEngine,
    graphs: RwLock<HashMap<String, Arc<CompiledGraph>>>,
}

impl Orchestrator {
    pub fn new(gov: Arc<GovernanceContext>) -> Self {
        Self {
            engine: ExecutionEngine::new(gov),
            graphs: RwLock::new(HashMap::new()),
        }
    }

    pub fn governance(&self) -> &Arc<GovernanceContext> {
        self.engine.governance()
    }

    /// Register a compiled graph under `id`, replacing any previous one.
    pub fn register_graph(&self, id: impl Into<String>, graph: CompiledGraph) {
        let id = id.into();
        info!(graph = %id, nodes = graph.node_count(), "Graph registered");
        if let Ok(mut graphs) = self.graphs.write() {
            graphs.insert(id, Arc::new(graph));
        }
    }

    pub fn graph_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .graphs
            .read()
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Start a run of a registered graph.
    pub fn submit_run(
        &self,
        graph_id: &str,
        initial: StateMap,
        options: RunOptions,
    ) -> Result<RunHandle> {
        let graph = self
            .graphs
            .read()
            .ok()
            .and_then(|g| g.get(graph_id).cloned())
            .ok_or_else(|| MarshalError::GraphDefinition(format!("unknown graph '{}'", graph_id)))?;

        let gov = self.engine.governance().clone();
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let policies = gov.policy.snapshot();

        let engine = self.engine.clone();
        let task_run_id = run_id.clone();
        let task_cancel = cancel.clone();
        let store = gov.state_store.clone();
        let log_stop = CancellationToken::new();
        let logger = gov
            .run_log
            .clone()
            .map(|l| l.spawn(&gov.event_bus, run_id.clone(), log_stop.clone()));
        let join = tokio::spawn(async move {
            let outcome = engine
                .run_with(task_run_id.clone(), graph, initial, options, policies, task_cancel)
                .await;
            if let Some(logger) = logger {
                log_stop.cancel();
                if let Err(e) = logger.await {
                    warn!(run_id = %task_run_id, error = %e, "Run logger task failed");
                }
            }
            if let Some(store) = store {
                if let Err(e) = store.save(&task_run_id, outcome.state()).await {
                    warn!(run_id = %task_run_id, error = %e, "Failed to persist run state");
                }
            }
            outcome
        });

        info!(run_id = %run_id, graph = %graph_id, "Run submitted");
        Ok(RunHandle {
            run_id,
            graph_id: graph_id.to_string(),
            cancel,
            approvals: gov.approvals.clone(),
            join,
        })
    }
}

/// Handle to a submitted run.
pub struct RunHandle {
    pub run_id: RunId,
    graph_id: String,
    cancel: CancellationToken,
    approvals: Arc<ApprovalCoordinator>,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Stop the run at its next suspension point and expire its pending
    /// approvals.
    pub async fn cancel(&self) {
        info!(run_id = %self.run_id, "Cancelling run");
        self.cancel.cancel();
        self.approvals.cancel_run(&self.run_id.0).await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run's outcome.
    pub async fn await_result(self) -> RunOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Run task aborted");
                RunOutcome::Failed(FailureReport::aborted(
                    self.run_id,
                    &self.graph_id,
                    format!("run task aborted: {}", e),
                ))
            }
        }
    }
}
