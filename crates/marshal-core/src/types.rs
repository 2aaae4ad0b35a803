use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::policy::{RiskLevel, Severity, Urgency, Violation};

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw key → value view of run state.
pub type StateMap = HashMap<String, serde_json::Value>;

/// Keys written by a single node invocation.
pub type StateDelta = StateMap;

/// A proposed side-effecting operation, validated before the node runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    pub node: String,
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub estimated_cost_cents: u64,
    #[serde(default)]
    pub risk: RiskLevel,
    /// Budget periods the cost is charged against.
    #[serde(default)]
    pub budget_keys: Vec<String>,
}

impl ActionRequest {
    pub fn new(node: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            run_id: None,
            node: node.into(),
            action: action.into(),
            parameters: serde_json::Map::new(),
            resources: Vec::new(),
            estimated_cost_cents: 0,
            risk: RiskLevel::default(),
            budget_keys: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }

    pub fn with_cost(mut self, cents: u64) -> Self {
        self.estimated_cost_cents = cents;
        self
    }

    pub fn with_budget_keys(mut self, keys: Vec<String>) -> Self {
        self.budget_keys = keys;
        self
    }

    /// One-line rendering for approval prompts and logs.
    pub fn summary(&self) -> String {
        let params = serde_json::to_string(&self.parameters).unwrap_or_default();
        let params = if params.len() > 120 {
            format!("{}...", truncate_on_char_boundary(&params, 120))
        } else {
            params
        };
        format!("{} {}", self.action, params)
    }
}

fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Lifecycle status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Escalated,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Expired)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

/// A pending or resolved human decision gating an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub node: String,
    pub action: String,
    pub risk: RiskLevel,
    pub urgency: Urgency,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub escalation_count: u32,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Final outcome of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Success,
    Denied,
    Failed,
    Timeout,
}

/// Something that happened while a step attempt was in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepNote {
    ApprovalRequested { request_id: String },
    ApprovalEscalated { request_id: String },
    ApprovalResolved { request_id: String, status: ApprovalStatus },
    FallbackTaken { target: String },
}

/// Audit trail entry for one attempt at executing a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub node: String,
    pub attempt: u32,
    /// Version of the state snapshot the node read.
    pub input_version: u64,
    #[serde(default)]
    pub output_delta: Option<StateDelta>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub notes: Vec<StepNote>,
}

impl StepRecord {
    pub fn elapsed_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

/// Events emitted by the engine and the governance layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run was accepted and started.
    RunStarted { run_id: RunId, graph_id: String },
    /// A node attempt began.
    NodeStarted { run_id: RunId, node: String, attempt: u32 },
    /// A node attempt succeeded.
    NodeCompleted { run_id: RunId, node: String, elapsed_ms: u64 },
    /// A node attempt failed (denied, timed out, or errored).
    NodeFailed {
        run_id: RunId,
        node: String,
        attempt: u32,
        kind: ErrorKind,
        error: String,
    },
    /// An approval was requested for an action.
    ApprovalRequested { request: ApprovalRequest },
    /// An unresolved approval was escalated to a higher authority.
    ApprovalEscalated { request_id: String, escalation_count: u32 },
    /// An approval left the pending state.
    ApprovalResolved { request_id: String, status: ApprovalStatus },
    /// A circuit breaker tripped for an action.
    CircuitOpened { action: String, failure_count: u32 },
    /// A budget period crossed a warning threshold.
    BudgetWarning {
        period: String,
        threshold_pct: u8,
        consumed: u64,
        limit: u64,
    },
    /// A budget period went over its limit.
    BudgetExceeded { period: String, consumed: u64, limit: u64 },
    /// A guardrail denied an action.
    PolicyViolation { violation: Violation },
    /// A run reached a terminal node.
    RunCompleted { run_id: RunId, steps: usize },
    /// A run terminated with a failure report.
    RunFailed { run_id: RunId, kind: ErrorKind, error: String },
}

impl EngineEvent {
    /// Stable event name, used by loggers and subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::NodeFailed { .. } => "node_failed",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ApprovalEscalated { .. } => "approval_escalated",
            Self::ApprovalResolved { .. } => "approval_resolved",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::BudgetWarning { .. } => "budget_warning",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::PolicyViolation { .. } => "policy_violation",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
        }
    }

    /// Run the event belongs to, if any.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => Some(run_id.0.as_str()),
            Self::ApprovalRequested { request } => request.run_id.as_deref(),
            Self::PolicyViolation { violation } => violation.run_id.as_deref(),
            _ => None,
        }
    }

    /// Whether this event closes out a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. } | Self::RunFailed { .. })
    }
}

/// Convenience for the severity of non-pattern denials.
pub fn denial_severity(risk: RiskLevel) -> Severity {
    match risk {
        RiskLevel::Low => Severity::Low,
        RiskLevel::Medium => Severity::Medium,
        RiskLevel::High => Severity::High,
        RiskLevel::Critical => Severity::Critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_request_builder() {
        let req = ActionRequest::new("deploy", "run_command")
            .with_param("cmd", serde_json::json!("make release"))
            .with_resource("/workspace/app")
            .with_cost(25);
        assert_eq!(req.node, "deploy");
        assert_eq!(req.action, "run_command");
        assert_eq!(req.resources, vec!["/workspace/app"]);
        assert_eq!(req.estimated_cost_cents, 25);
        assert!(req.summary().starts_with("run_command {"));
    }

    #[test]
    fn summary_truncates_long_params() {
        let req = ActionRequest::new("n", "http_call").with_param("body", serde_json::json!("é".repeat(200)));
        let summary = req.summary();
        assert!(summary.ends_with("..."));
        assert!(summary.len() < 200);
    }

    #[test]
    fn approval_status_terminality() {
        assert!(!ApprovalStatus::Pending.is_terminal());
        assert!(!ApprovalStatus::Escalated.is_terminal());
        assert!(ApprovalStatus::Approved.is_terminal());
        assert!(ApprovalStatus::Expired.is_terminal());
    }

    #[test]
    fn event_names_and_run_ids() {
        let run_id = RunId::from_str("run-1");
        let ev = EngineEvent::NodeStarted {
            run_id: run_id.clone(),
            node: "a".into(),
            attempt: 1,
        };
        assert_eq!(ev.name(), "node_started");
        assert_eq!(ev.run_id(), Some("run-1"));

        let ev = EngineEvent::CircuitOpened {
            action: "flaky_api".into(),
            failure_count: 3,
        };
        assert_eq!(ev.run_id(), None);

        let json = serde_json::to_value(EngineEvent::RunCompleted { run_id, steps: 2 }).unwrap();
        assert_eq!(json["event"], "run_completed");
    }

    #[test]
    fn denial_severity_tracks_risk() {
        assert_eq!(denial_severity(RiskLevel::High), Severity::High);
        assert_eq!(denial_severity(RiskLevel::Low), Severity::Low);
    }
}
