use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use marshal_core::config::{BudgetConfig, BudgetPeriodConfig, BudgetWindow};
use marshal_core::event::EventBus;
use marshal_core::types::EngineEvent;

/// Consumption state of one budget period.
#[derive(Debug, Clone)]
struct BudgetPeriod {
    window: BudgetWindow,
    limit: u64,
    consumed: u64,
    window_start: DateTime<Utc>,
    thresholds: Vec<u8>,
    warned: BTreeSet<u8>,
    exceeded_notified: bool,
}

impl BudgetPeriod {
    fn from_config(cfg: &BudgetPeriodConfig, now: DateTime<Utc>) -> Self {
        let mut thresholds = cfg.warn_thresholds.clone();
        thresholds.sort_unstable();
        thresholds.dedup();
        Self {
            window: cfg.window,
            limit: cfg.limit_cents,
            consumed: 0,
            window_start: window_start(cfg.window, now),
            thresholds,
            warned: BTreeSet::new(),
            exceeded_notified: false,
        }
    }

    /// Consumption as seen at `now`, without rolling the stored window.
    fn consumed_at(&self, now: DateTime<Utc>) -> u64 {
        if window_start(self.window, now) == self.window_start {
            self.consumed
        } else {
            0
        }
    }

    fn roll(&mut self, key: &str, now: DateTime<Utc>) {
        let start = window_start(self.window, now);
        if start != self.window_start {
            debug!(period = %key, from = %self.window_start, to = %start, "Budget period rolled over");
            self.window_start = start;
            self.consumed = 0;
            self.warned.clear();
            self.exceeded_notified = false;
        }
    }
}

/// Point-in-time view of a budget period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetStatus {
    pub key: String,
    pub window: BudgetWindow,
    pub consumed: u64,
    pub limit: u64,
    pub window_start: DateTime<Utc>,
    pub exceeded: bool,
}

/// Process-wide accounting of resource consumption per period.
///
/// All mutations of a period happen inside one critical section, so many
/// concurrent runs charging the same period never lose an increment or
/// double-fire a warning.
pub struct BudgetTracker {
    periods: Mutex<HashMap<String, BudgetPeriod>>,
    event_bus: Arc<EventBus>,
}

impl BudgetTracker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            periods: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    pub fn from_config(config: &BudgetConfig, event_bus: Arc<EventBus>) -> Self {
        let tracker = Self::new(event_bus);
        for period in &config.periods {
            tracker.add_period(period);
        }
        tracker
    }

    /// Register (or replace) a period.
    pub fn add_period(&self, cfg: &BudgetPeriodConfig) {
        let period = BudgetPeriod::from_config(cfg, Utc::now());
        if let Ok(mut periods) = self.periods.lock() {
            periods.insert(cfg.key.clone(), period);
        }
    }

    pub fn has_period(&self, key: &str) -> bool {
        self.periods
            .lock()
            .map(|p| p.contains_key(key))
            .unwrap_or(false)
    }

    /// Charge `cost` to every listed period.
    pub fn record(&self, cost: u64, keys: &[String]) {
        self.record_at(cost, keys, Utc::now());
    }

    pub fn record_at(&self, cost: u64, keys: &[String], now: DateTime<Utc>) {
        let mut events = Vec::new();
        {
            let Ok(mut periods) = self.periods.lock() else {
                return;
            };
            for key in keys {
                let Some(period) = periods.get_mut(key) else {
                    warn!(period = %key, "Cost recorded against unknown budget period");
                    continue;
                };
                period.roll(key, now);
                period.consumed = period.consumed.saturating_add(cost);

                for &pct in &period.thresholds {
                    let crossed =
                        period.consumed as u128 * 100 >= period.limit as u128 * pct as u128;
                    if crossed && period.warned.insert(pct) {
                        warn!(
                            period = %key,
                            threshold_pct = pct,
                            consumed = period.consumed,
                            limit = period.limit,
                            "Budget warning threshold crossed"
                        );
                        events.push(EngineEvent::BudgetWarning {
                            period: key.clone(),
                            threshold_pct: pct,
                            consumed: period.consumed,
                            limit: period.limit,
                        });
                    }
                }

                if period.consumed > period.limit && !period.exceeded_notified {
                    period.exceeded_notified = true;
                    warn!(
                        period = %key,
                        consumed = period.consumed,
                        limit = period.limit,
                        "Budget exceeded"
                    );
                    events.push(EngineEvent::BudgetExceeded {
                        period: key.clone(),
                        consumed: period.consumed,
                        limit: period.limit,
                    });
                }
            }
        }
        for event in events {
            self.event_bus.publish(event);
        }
    }

    /// Current status of a period; exceeded iff consumed > limit.
    pub fn check_budget(&self, key: &str) -> Option<BudgetStatus> {
        self.check_budget_at(key, Utc::now())
    }

    pub fn check_budget_at(&self, key: &str, now: DateTime<Utc>) -> Option<BudgetStatus> {
        let periods = self.periods.lock().ok()?;
        let period = periods.get(key)?;
        let consumed = period.consumed_at(now);
        Some(BudgetStatus {
            key: key.to_string(),
            window: period.window,
            consumed,
            limit: period.limit,
            window_start: window_start(period.window, now),
            exceeded: consumed > period.limit,
        })
    }

    /// Whether charging `cost` would push the period over its limit.
    /// Unknown periods never block.
    pub fn would_exceed(&self, key: &str, cost: u64) -> Option<BudgetStatus> {
        self.would_exceed_at(key, cost, Utc::now())
    }

    pub fn would_exceed_at(
        &self,
        key: &str,
        cost: u64,
        now: DateTime<Utc>,
    ) -> Option<BudgetStatus> {
        let mut status = self.check_budget_at(key, now)?;
        let projected = status.consumed.saturating_add(cost);
        if projected > status.limit {
            status.consumed = projected;
            status.exceeded = true;
            Some(status)
        } else {
            None
        }
    }

    /// Status of every registered period, sorted by key.
    pub fn snapshot(&self) -> Vec<BudgetStatus> {
        let now = Utc::now();
        let keys: Vec<String> = match self.periods.lock() {
            Ok(periods) => periods.keys().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        let mut out: Vec<BudgetStatus> = keys
            .iter()
            .filter_map(|k| self.check_budget_at(k, now))
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

/// Start of the wall-clock window (UTC) containing `now`.
pub fn window_start(window: BudgetWindow, now: DateTime<Utc>) -> DateTime<Utc> {
    let date = now.date_naive();
    let start = match window {
        BudgetWindow::Hour => date.and_hms_opt(now.hour(), 0, 0),
        BudgetWindow::Day => date.and_hms_opt(0, 0, 0),
        BudgetWindow::Week => {
            let back = Duration::days(date.weekday().num_days_from_monday() as i64);
            (date - back).and_hms_opt(0, 0, 0)
        }
        BudgetWindow::Month => date.with_day(1).and_then(|d| d.and_hms_opt(0, 0, 0)),
    };
    start.map(|s| s.and_utc()).unwrap_or(now)
}
