use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarshalError {
    // Graph errors
    #[error("Graph definition error: {0}")]
    GraphDefinition(String),

    #[error("Loop limit exceeded after {0} steps")]
    LoopLimitExceeded(usize),

    // Governance errors
    #[error("Action denied by policy: {action}: {reason}")]
    PolicyDenied { action: String, reason: String },

    #[error("Budget exceeded for period {period}: {consumed}/{limit}")]
    BudgetExceeded {
        period: String,
        consumed: u64,
        limit: u64,
    },

    #[error("Circuit open for action: {action}")]
    CircuitOpen { action: String },

    // Approval errors
    #[error("Approval expired for action {action} (request {request_id})")]
    ApprovalExpired { action: String, request_id: String },

    #[error("Approval rejected for action {action}: {reason}")]
    ApprovalRejected { action: String, reason: String },

    #[error("Approval request already resolved: {0}")]
    AlreadyResolved(String),

    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    // Node errors
    #[error("Node timeout after {timeout_ms}ms: {node}")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("Node execution failed: {node}: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Malformed action from node {node}: {message}")]
    MalformedAction { node: String, message: String },

    #[error("Voting error: {0}")]
    Voting(String),

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable classification of an error, carried in failure reports and step records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    GraphDefinition,
    LoopLimitExceeded,
    PolicyDenied,
    BudgetExceeded,
    CircuitOpen,
    ApprovalExpired,
    ApprovalRejected,
    AlreadyResolved,
    Timeout,
    NodeExecution,
    MalformedAction,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GraphDefinition => "graph_definition",
            Self::LoopLimitExceeded => "loop_limit_exceeded",
            Self::PolicyDenied => "policy_denied",
            Self::BudgetExceeded => "budget_exceeded",
            Self::CircuitOpen => "circuit_open",
            Self::ApprovalExpired => "approval_expired",
            Self::ApprovalRejected => "approval_rejected",
            Self::AlreadyResolved => "already_resolved",
            Self::Timeout => "timeout",
            Self::NodeExecution => "node_execution",
            Self::MalformedAction => "malformed_action",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl MarshalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::GraphDefinition(_) => ErrorKind::GraphDefinition,
            Self::LoopLimitExceeded(_) => ErrorKind::LoopLimitExceeded,
            Self::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::ApprovalExpired { .. } => ErrorKind::ApprovalExpired,
            Self::ApprovalRejected { .. } => ErrorKind::ApprovalRejected,
            Self::AlreadyResolved(_) => ErrorKind::AlreadyResolved,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NodeExecution { .. } => ErrorKind::NodeExecution,
            Self::MalformedAction { .. } => ErrorKind::MalformedAction,
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether a node's retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::NodeExecution { .. } | Self::MalformedAction { .. }
        )
    }

    /// Whether a declared fallback edge may absorb this error.
    pub fn allows_fallback(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::LoopLimitExceeded(_) | Self::GraphDefinition(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MarshalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let timeout = MarshalError::Timeout {
            node: "b".into(),
            timeout_ms: 10,
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let denied = MarshalError::PolicyDenied {
            action: "run_command".into(),
            reason: "rate_limit_exceeded".into(),
        };
        assert!(!denied.is_retryable());
        assert!(denied.allows_fallback());

        assert!(!MarshalError::Cancelled.allows_fallback());
        assert!(!MarshalError::LoopLimitExceeded(5).allows_fallback());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::LoopLimitExceeded).unwrap();
        assert_eq!(json, "\"loop_limit_exceeded\"");
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "circuit_open");
    }
}
