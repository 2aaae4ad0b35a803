use std::sync::Arc;

use tracing::info;

use marshal_core::config::{expand_home, AppConfig, EngineConfig};
use marshal_core::error::{MarshalError, Result};
use marshal_core::event::EventBus;
use marshal_core::traits::{ApprovalChannel, StateStore};

use crate::approval::{ApprovalCoordinator, LoggingChannel};
use crate::audit::{AuditJournal, AuditLog};
use crate::breaker::CircuitBreakers;
use crate::budget::BudgetTracker;
use crate::guardrails::PolicyEngine;
use crate::run_log::RunLogger;
use crate::store::SqliteStateStore;

/// Process-wide governance services, built once at startup and shared by
/// `Arc` into every run.
pub struct GovernanceContext {
    pub engine: EngineConfig,
    pub event_bus: Arc<EventBus>,
    pub budget: Arc<BudgetTracker>,
    pub breakers: Arc<CircuitBreakers>,
    pub policy: Arc<PolicyEngine>,
    pub approvals: Arc<ApprovalCoordinator>,
    pub audit: Arc<AuditLog>,
    pub state_store: Option<Arc<dyn StateStore>>,
    /// Per-run JSONL logging, when `[log]` is configured and enabled.
    pub run_log: Option<RunLogger>,
}

impl GovernanceContext {
    /// Build from config, delivering approvals through the tracing log.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::with_channel(config, Arc::new(LoggingChannel))
    }

    pub fn with_channel(config: &AppConfig, channel: Arc<dyn ApprovalChannel>) -> Result<Self> {
        let event_bus = Arc::new(EventBus::default());

        let audit = match &config.audit.journal_path {
            Some(path) => {
                let path = expand_home(path);
                let journal = AuditJournal::open(&path).map_err(MarshalError::Database)?;
                info!(path = %path.display(), "Audit journal opened");
                AuditLog::with_journal(journal)
            }
            None => AuditLog::new(),
        };

        let state_store: Option<Arc<dyn StateStore>> = match &config.audit.state_path {
            Some(path) => {
                let path = expand_home(path);
                let store = SqliteStateStore::open(&path)?;
                info!(path = %path.display(), "State store opened");
                Some(Arc::new(store))
            }
            None => None,
        };

        let budget = Arc::new(BudgetTracker::from_config(&config.budget, event_bus.clone()));
        let breakers = Arc::new(CircuitBreakers::new(
            config.breaker.clone(),
            event_bus.clone(),
        ));
        let audit = Arc::new(audit);
        let policy = Arc::new(PolicyEngine::new(
            config.policies.clone(),
            budget.clone(),
            breakers.clone(),
            audit.clone(),
            event_bus.clone(),
        ));
        let approvals = Arc::new(ApprovalCoordinator::new(
            config.approval.clone(),
            channel,
            event_bus.clone(),
        ));

        Ok(Self {
            engine: config.engine.clone(),
            event_bus,
            budget,
            breakers,
            policy,
            approvals,
            audit,
            state_store,
            run_log: RunLogger::from_config(config),
        })
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }
}
