use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use marshal_core::error::{MarshalError, Result};
use marshal_core::event::EventBus;
use marshal_core::policy::{Decision, PatternMatcher, Policy, PolicyTable, Severity, Violation};
use marshal_core::types::{denial_severity, ActionRequest, EngineEvent};

use crate::audit::AuditLog;
use crate::breaker::{Admission, CircuitBreakers};
use crate::budget::BudgetTracker;

/// A policy with its forbidden patterns compiled.
pub struct CompiledPolicy {
    pub policy: Policy,
    matcher: PatternMatcher,
}

/// Immutable, versioned view of the policy table. Runs hold one for their
/// whole lifetime, so a swap never changes the rules under a running graph.
pub struct PolicySnapshot {
    pub version: u64,
    policies: HashMap<String, CompiledPolicy>,
}

impl PolicySnapshot {
    fn compile(version: u64, table: PolicyTable) -> Self {
        let defaults = Policy::default_patterns();
        let policies = table
            .into_iter()
            .map(|(action, policy)| {
                let mut patterns = defaults.clone();
                patterns.extend(policy.forbidden_patterns.iter().cloned());
                let matcher = PatternMatcher::new(&patterns);
                (action, CompiledPolicy { policy, matcher })
            })
            .collect();
        Self { version, policies }
    }

    pub fn get(&self, action: &str) -> Option<&Policy> {
        self.policies.get(action).map(|c| &c.policy)
    }

    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        actions.sort();
        actions
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Sliding one-hour window of per-minute admission counts for one action.
#[derive(Default)]
struct RateWindow {
    buckets: VecDeque<(i64, u32)>,
}

impl RateWindow {
    const MINUTES: i64 = 60;

    fn count(&self, minute: i64) -> u32 {
        self.buckets
            .iter()
            .filter(|(m, _)| *m > minute - Self::MINUTES)
            .map(|(_, c)| *c)
            .sum()
    }

    fn hit(&mut self, minute: i64) {
        while let Some((m, _)) = self.buckets.front() {
            if *m <= minute - Self::MINUTES {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
        match self.buckets.back_mut() {
            Some((m, c)) if *m == minute => *c += 1,
            _ => self.buckets.push_back((minute, 1)),
        }
    }
}

/// Per-action sliding-window admission counter.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    fn minute(now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(60)
    }

    /// Admissions recorded in the hour ending at `now`.
    pub fn count_at(&self, action: &str, now: DateTime<Utc>) -> u32 {
        self.windows
            .lock()
            .map(|w| w.get(action).map(|r| r.count(Self::minute(now))).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Record an admission if it fits under `limit`. Check and record are one
    /// critical section.
    pub fn try_hit_at(&self, action: &str, limit: Option<u32>, now: DateTime<Utc>) -> bool {
        let Ok(mut windows) = self.windows.lock() else {
            return false;
        };
        let minute = Self::minute(now);
        let window = windows.entry(action.to_string()).or_default();
        if let Some(limit) = limit {
            if window.count(minute) >= limit {
                return false;
            }
        }
        window.hit(minute);
        true
    }
}

/// Why a request was refused, and the error it maps to on admission.
struct Denial {
    reason: String,
    severity: Severity,
    detail: Option<String>,
    error: MarshalError,
}

/// PolicyEngine — validates proposed actions before any side effect runs.
///
/// Deny-by-default: actions missing from the policy table are refused.
pub struct PolicyEngine {
    current: RwLock<Arc<PolicySnapshot>>,
    rates: RateLimiter,
    budget: Arc<BudgetTracker>,
    breakers: Arc<CircuitBreakers>,
    audit: Arc<AuditLog>,
    event_bus: Arc<EventBus>,
}

impl PolicyEngine {
    pub fn new(
        table: PolicyTable,
        budget: Arc<BudgetTracker>,
        breakers: Arc<CircuitBreakers>,
        audit: Arc<AuditLog>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            current: RwLock::new(Arc::new(PolicySnapshot::compile(1, table))),
            rates: RateLimiter::default(),
            budget,
            breakers,
            audit,
            event_bus,
        }
    }

    /// The policy snapshot new runs should capture.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        match self.current.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Install a new policy table. In-flight runs keep their snapshot.
    pub fn swap(&self, table: PolicyTable) -> u64 {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let version = current.version + 1;
        *current = Arc::new(PolicySnapshot::compile(version, table));
        info!(version, actions = current.len(), "Policy table swapped");
        version
    }

    /// Admissions counted against `action` in the trailing hour.
    pub fn rate_count(&self, action: &str) -> u32 {
        self.rates.count_at(action, Utc::now())
    }

    /// Check a request without touching any counter. Denials are audited.
    pub fn validate(&self, snapshot: &PolicySnapshot, req: &ActionRequest) -> Decision {
        match self.evaluate(snapshot, req, Utc::now()) {
            Ok(()) => Decision::Allowed,
            Err(denial) => {
                let decision = Decision::denied(denial.reason.clone(), denial.severity);
                self.record_violation(req, denial);
                decision
            }
        }
    }

    /// Like [`validate`](Self::validate), returning the denial as an error.
    pub fn check(&self, snapshot: &PolicySnapshot, req: &ActionRequest) -> Result<()> {
        self.evaluate(snapshot, req, Utc::now())
            .map_err(|denial| self.record_violation(req, denial))
    }

    /// Validate, then record the rate-limit hit and take the breaker
    /// admission. The returned admission must be reported back to the
    /// breakers with the call's outcome.
    pub fn admit(&self, snapshot: &PolicySnapshot, req: &ActionRequest) -> Result<Admission> {
        let now = Utc::now();
        if let Err(denial) = self.evaluate(snapshot, req, now) {
            return Err(self.record_violation(req, denial));
        }

        let admission = match self.breakers.acquire(&req.action) {
            Ok(a) => a,
            Err(e) => {
                return Err(self.record_violation(
                    req,
                    Denial {
                        reason: "circuit_open".into(),
                        severity: Severity::Medium,
                        detail: None,
                        error: e,
                    },
                ))
            }
        };

        let limit = snapshot.get(&req.action).and_then(|p| p.rate_limit_per_hour);
        if !self.rates.try_hit_at(&req.action, limit, now) {
            self.breakers.release(&req.action, admission);
            return Err(self.record_violation(req, self.rate_denial(req, limit.unwrap_or(0))));
        }

        debug!(action = %req.action, node = %req.node, ?admission, "Action admitted");
        Ok(admission)
    }

    fn evaluate(
        &self,
        snapshot: &PolicySnapshot,
        req: &ActionRequest,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), Denial> {
        let Some(compiled) = snapshot.policies.get(&req.action) else {
            return Err(policy_denial(req, "unregistered_action", Severity::High, None));
        };
        let policy = &compiled.policy;
        let risk = policy.risk_level.max(req.risk);

        if let Some(limit) = policy.rate_limit_per_hour {
            if self.rates.count_at(&req.action, now) >= limit {
                return Err(self.rate_denial(req, limit));
            }
        }

        if let Some(max) = policy.max_cost_cents {
            if req.estimated_cost_cents > max {
                return Err(policy_denial(
                    req,
                    "cost_ceiling_exceeded",
                    denial_severity(risk),
                    Some(format!("estimated {} > ceiling {}", req.estimated_cost_cents, max)),
                ));
            }
        }

        let params = serde_json::Value::Object(req.parameters.clone());
        if let Some(label) = compiled.matcher.find_in_value(&params) {
            error!(
                action = %req.action,
                node = %req.node,
                pattern = %label,
                "Forbidden pattern in action parameters"
            );
            return Err(policy_denial(
                req,
                &format!("forbidden_pattern:{}", label),
                Severity::Critical,
                Some(req.summary()),
            ));
        }

        if !policy.allowed_resource_prefixes.is_empty() {
            if let Some(resource) = req.resources.iter().find(|r| {
                !policy
                    .allowed_resource_prefixes
                    .iter()
                    .any(|p| r.starts_with(p.as_str()))
            }) {
                return Err(policy_denial(
                    req,
                    "resource_out_of_scope",
                    Severity::High,
                    Some(resource.clone()),
                ));
            }
        }

        for key in &req.budget_keys {
            if let Some(status) =
                self.budget
                    .would_exceed_at(key, req.estimated_cost_cents, now)
            {
                return Err(Denial {
                    reason: "budget_exceeded".into(),
                    severity: denial_severity(risk),
                    detail: Some(format!("{} projected {}/{}", key, status.consumed, status.limit)),
                    error: MarshalError::BudgetExceeded {
                        period: key.clone(),
                        consumed: status.consumed,
                        limit: status.limit,
                    },
                });
            }
        }

        if !self.breakers.peek(&req.action) {
            return Err(Denial {
                reason: "circuit_open".into(),
                severity: Severity::Medium,
                detail: None,
                error: MarshalError::CircuitOpen {
                    action: req.action.clone(),
                },
            });
        }

        Ok(())
    }

    fn rate_denial(&self, req: &ActionRequest, limit: u32) -> Denial {
        policy_denial(
            req,
            "rate_limit_exceeded",
            Severity::Medium,
            Some(format!("{} per hour", limit)),
        )
    }

    fn record_violation(&self, req: &ActionRequest, denial: Denial) -> MarshalError {
        warn!(
            action = %req.action,
            node = %req.node,
            reason = %denial.reason,
            severity = %denial.severity,
            "Action denied"
        );
        let violation = Violation {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            run_id: req.run_id.clone(),
            node: req.node.clone(),
            action: req.action.clone(),
            severity: denial.severity,
            reason: denial.reason,
            detail: denial.detail,
        };
        self.audit.append_violation(violation.clone());
        self.event_bus
            .publish(EngineEvent::PolicyViolation { violation });
        denial.error
    }
}

fn policy_denial(
    req: &ActionRequest,
    reason: &str,
    severity: Severity,
    detail: Option<String>,
) -> Denial {
    Denial {
        reason: reason.to_string(),
        severity,
        detail,
        error: MarshalError::PolicyDenied {
            action: req.action.clone(),
            reason: reason.to_string(),
        },
    }
}
