//! Shared fixtures for Marshal integration tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use marshal_core::config::AppConfig;
use marshal_core::error::{MarshalError, Result};
use marshal_core::event::EventSink;
use marshal_core::traits::ApprovalChannel;
use marshal_core::types::{ApprovalRequest, EngineEvent, StateDelta};
use marshal_engine::graph::{ExecutionState, NodeExecutor};
use marshal_engine::{ApprovalCoordinator, GovernanceContext};

/// Build a delta from `(key, value)` pairs.
pub fn delta(pairs: &[(&str, serde_json::Value)]) -> StateDelta {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Governance context from inline TOML. Panics on invalid config.
pub fn governance(toml: &str) -> Arc<GovernanceContext> {
    let config = AppConfig::from_toml(toml).expect("valid test config");
    Arc::new(GovernanceContext::from_config(&config).expect("governance context"))
}

/// Same as [`governance`], delivering approvals to `channel`.
pub fn governance_with_channel(
    toml: &str,
    channel: Arc<dyn ApprovalChannel>,
) -> Arc<GovernanceContext> {
    let config = AppConfig::from_toml(toml).expect("valid test config");
    Arc::new(GovernanceContext::with_channel(&config, channel).expect("governance context"))
}

/// Returns the same delta on every call and counts invocations.
pub struct StaticExecutor {
    delta: StateDelta,
    calls: AtomicU32,
}

impl StaticExecutor {
    pub fn new(delta: StateDelta) -> Arc<Self> {
        Arc::new(Self {
            delta,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NodeExecutor for StaticExecutor {
    fn execute(&self, _state: ExecutionState) -> BoxFuture<'_, Result<StateDelta>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(self.delta.clone()) })
    }
}

/// Fails with a node execution error for the first `failures` calls, then
/// returns `delta`.
pub struct FlakyExecutor {
    node: String,
    failures: u32,
    delta: StateDelta,
    calls: AtomicU32,
}

impl FlakyExecutor {
    pub fn new(node: &str, failures: u32, delta: StateDelta) -> Arc<Self> {
        Arc::new(Self {
            node: node.to_string(),
            failures,
            delta,
            calls: AtomicU32::new(0),
        })
    }

    /// Never succeeds.
    pub fn always(node: &str) -> Arc<Self> {
        Self::new(node, u32::MAX, StateDelta::new())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NodeExecutor for FlakyExecutor {
    fn execute(&self, _state: ExecutionState) -> BoxFuture<'_, Result<StateDelta>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if n < self.failures {
                Err(MarshalError::NodeExecution {
                    node: self.node.clone(),
                    message: format!("injected failure {}", n + 1),
                })
            } else {
                Ok(self.delta.clone())
            }
        })
    }
}

/// Sleeps on the tokio clock before returning `delta`.
pub struct SleepExecutor {
    duration: Duration,
    delta: StateDelta,
}

impl SleepExecutor {
    pub fn new(duration: Duration, delta: StateDelta) -> Arc<Self> {
        Arc::new(Self { duration, delta })
    }
}

impl NodeExecutor for SleepExecutor {
    fn execute(&self, _state: ExecutionState) -> BoxFuture<'_, Result<StateDelta>> {
        Box::pin(async move {
            tokio::time::sleep(self.duration).await;
            Ok(self.delta.clone())
        })
    }
}

/// Approval channel that remembers what it was asked to deliver.
#[derive(Default)]
pub struct RecordingChannel {
    pub notified: Mutex<Vec<String>>,
    pub escalated: Mutex<Vec<String>>,
}

impl ApprovalChannel for RecordingChannel {
    fn notify(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        if let Ok(mut n) = self.notified.lock() {
            n.push(request.id.clone());
        }
        Box::pin(async { Ok(()) })
    }

    fn escalate(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        if let Ok(mut e) = self.escalated.lock() {
            e.push(request.id.clone());
        }
        Box::pin(async { Ok(()) })
    }
}

/// Event sink that keeps every event in publish order.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name()).collect()
    }
}

impl EventSink for CollectingSink {
    fn deliver(&self, event: &EngineEvent) {
        if let Ok(mut e) = self.events.lock() {
            e.push(event.clone());
        }
    }
}

/// How an [`spawn_approver`] task answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject,
}

/// Answer every approval request published on the bus after `delay`.
///
/// The listener is subscribed before this returns, so requests raised by a
/// run started afterwards are never missed.
pub fn spawn_approver(
    gov: &Arc<GovernanceContext>,
    delay: Duration,
    verdict: Verdict,
) -> JoinHandle<()> {
    let mut rx = gov.event_bus.subscribe();
    let approvals: Arc<ApprovalCoordinator> = gov.approvals.clone();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let EngineEvent::ApprovalRequested { request } = event else {
                continue;
            };
            let approvals = approvals.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = match verdict {
                    Verdict::Approve => approvals.approve(&request.id, "test-approver").await,
                    Verdict::Reject => {
                        approvals
                            .reject(&request.id, "test-approver", "not today")
                            .await
                    }
                };
            });
        }
    })
}
