use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use marshal_core::config::BreakerConfig;
use marshal_core::error::{MarshalError, Result};
use marshal_core::event::EventBus;
use marshal_core::types::EngineEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// How a call got through the breaker. Report the outcome with the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call while the circuit is closed.
    Closed,
    /// The single trial call after cooldown.
    Probe,
}

#[derive(Debug)]
struct Cell {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    threshold: u32,
    cooldown: Duration,
}

impl Cell {
    fn cooldown_elapsed(&self) -> bool {
        self.opened_at
            .map(|t| t.elapsed() >= self.cooldown)
            .unwrap_or(true)
    }
}

/// Read-only view of one action's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub action: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub cooldown_secs: u64,
}

/// Process-wide circuit breakers, one per action identifier.
///
/// Each transition is a check-and-set under the registry lock, so when the
/// cooldown elapses exactly one caller is admitted as the half-open probe.
pub struct CircuitBreakers {
    cells: Mutex<HashMap<String, Cell>>,
    config: BreakerConfig,
    event_bus: Arc<EventBus>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            config,
            event_bus,
        }
    }

    fn with_cell<T>(&self, action: &str, f: impl FnOnce(&mut Cell) -> T) -> T {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        let cell = cells.entry(action.to_string()).or_insert_with(|| {
            let (threshold, cooldown) = self.config.settings_for(action);
            Cell {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                last_failure: None,
                threshold,
                cooldown,
            }
        });
        f(cell)
    }

    /// Whether a call would currently be admitted. Never changes state.
    pub fn peek(&self, action: &str) -> bool {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        match cells.get(action) {
            None => true,
            Some(cell) => match cell.state {
                CircuitState::Closed => true,
                CircuitState::Open => cell.cooldown_elapsed(),
                CircuitState::HalfOpen => false,
            },
        }
    }

    /// Try to pass the breaker. Rejections leave every counter untouched.
    pub fn acquire(&self, action: &str) -> Result<Admission> {
        self.with_cell(action, |cell| match cell.state {
            CircuitState::Closed => Ok(Admission::Closed),
            CircuitState::Open if cell.cooldown_elapsed() => {
                cell.state = CircuitState::HalfOpen;
                info!(action = %action, "Circuit half-open, admitting probe");
                Ok(Admission::Probe)
            }
            CircuitState::Open | CircuitState::HalfOpen => Err(MarshalError::CircuitOpen {
                action: action.to_string(),
            }),
        })
    }

    pub fn record_success(&self, action: &str, admission: Admission) {
        self.with_cell(action, |cell| {
            if admission == Admission::Probe {
                info!(action = %action, "Probe succeeded, circuit closed");
                cell.state = CircuitState::Closed;
                cell.opened_at = None;
            }
            if cell.state == CircuitState::Closed {
                cell.failure_count = 0;
            }
        });
    }

    pub fn record_failure(&self, action: &str, admission: Admission) {
        let opened = self.with_cell(action, |cell| {
            cell.failure_count = cell.failure_count.saturating_add(1);
            cell.last_failure = Some(Utc::now());
            match (admission, cell.state) {
                (Admission::Probe, _) => {
                    warn!(action = %action, "Probe failed, circuit re-opened");
                    cell.state = CircuitState::Open;
                    cell.opened_at = Some(Instant::now());
                    Some(cell.failure_count)
                }
                (Admission::Closed, CircuitState::Closed)
                    if cell.failure_count >= cell.threshold =>
                {
                    warn!(
                        action = %action,
                        failures = cell.failure_count,
                        cooldown_secs = cell.cooldown.as_secs(),
                        "Circuit opened"
                    );
                    cell.state = CircuitState::Open;
                    cell.opened_at = Some(Instant::now());
                    Some(cell.failure_count)
                }
                _ => None,
            }
        });
        if let Some(failure_count) = opened {
            self.event_bus.publish(EngineEvent::CircuitOpened {
                action: action.to_string(),
                failure_count,
            });
        }
    }

    /// Give back an admission whose call never ran (denied, cancelled).
    /// A released probe leaves the circuit open so the next caller may probe.
    pub fn release(&self, action: &str, admission: Admission) {
        if admission != Admission::Probe {
            return;
        }
        self.with_cell(action, |cell| {
            if cell.state == CircuitState::HalfOpen {
                debug!(action = %action, "Probe released without outcome");
                cell.state = CircuitState::Open;
            }
        });
    }

    pub fn snapshot(&self, action: &str) -> CircuitSnapshot {
        self.with_cell(action, |cell| CircuitSnapshot {
            action: action.to_string(),
            state: cell.state,
            failure_count: cell.failure_count,
            last_failure: cell.last_failure,
            threshold: cell.threshold,
            cooldown_secs: cell.cooldown.as_secs(),
        })
    }

    /// Snapshots of every action seen so far, sorted by action.
    pub fn all(&self) -> Vec<CircuitSnapshot> {
        let mut actions: Vec<String> = {
            let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            cells.keys().cloned().collect()
        };
        actions.sort();
        actions.iter().map(|a| self.snapshot(a)).collect()
    }
}
