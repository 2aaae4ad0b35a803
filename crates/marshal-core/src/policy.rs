use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Risk level of an action. Ordered from least to most dangerous.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Default per-invocation timeout. Riskier actions get less time.
    pub fn default_timeout(&self) -> Duration {
        match self {
            Self::Low => Duration::from_secs(300),
            Self::Medium => Duration::from_secs(120),
            Self::High => Duration::from_secs(60),
            Self::Critical => Duration::from_secs(30),
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

/// Urgency of an approval request; determines how long it stays open.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Urgency {
    /// Default approval lifetime.
    pub fn default_timeout(&self) -> Duration {
        match self {
            Self::Low => Duration::from_secs(24 * 3600),
            Self::Normal => Duration::from_secs(4 * 3600),
            Self::High => Duration::from_secs(3600),
            Self::Critical => Duration::from_secs(15 * 60),
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Severity of a policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Guardrail rules for a single action identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub risk_level: RiskLevel,

    /// Gate execution on a human approval.
    #[serde(default)]
    pub requires_approval: bool,

    /// Maximum admissions in any sliding one-hour window (None = unlimited).
    #[serde(default)]
    pub rate_limit_per_hour: Option<u32>,

    /// Ceiling on the estimated cost of a single invocation.
    #[serde(default)]
    pub max_cost_cents: Option<u64>,

    /// Patterns that must never appear in string parameters.
    #[serde(default)]
    pub forbidden_patterns: Vec<ForbiddenPattern>,

    /// Resource allow-list; empty means any resource is in scope.
    #[serde(default)]
    pub allowed_resource_prefixes: Vec<String>,

    /// Urgency used when this action asks for approval.
    #[serde(default)]
    pub urgency: Urgency,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            risk_level: RiskLevel::Medium,
            requires_approval: false,
            rate_limit_per_hour: None,
            max_cost_cents: None,
            forbidden_patterns: Vec::new(),
            allowed_resource_prefixes: Vec::new(),
            urgency: Urgency::Normal,
        }
    }
}

impl Policy {
    /// Built-in forbidden parameter patterns.
    pub fn default_patterns() -> Vec<ForbiddenPattern> {
        vec![
            ForbiddenPattern {
                pattern: r"rm\s+(-\w*)?r".to_string(),
                label: "recursive delete".to_string(),
            },
            ForbiddenPattern {
                pattern: r"git\s+push\s+.*--force".to_string(),
                label: "force push".to_string(),
            },
            ForbiddenPattern {
                pattern: r"git\s+reset\s+--hard".to_string(),
                label: "hard reset".to_string(),
            },
            ForbiddenPattern {
                pattern: r"(?i)DROP\s+TABLE".to_string(),
                label: "SQL drop".to_string(),
            },
            ForbiddenPattern {
                pattern: r"chmod\s+777".to_string(),
                label: "wide-open permissions".to_string(),
            },
            ForbiddenPattern {
                pattern: r"curl.*\|\s*(ba)?sh".to_string(),
                label: "pipe to shell".to_string(),
            },
        ]
    }
}

/// Declarative policy table: action identifier → rules.
pub type PolicyTable = HashMap<String, Policy>;

/// A regex that marks a parameter value as forbidden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForbiddenPattern {
    pub pattern: String,
    pub label: String,
}

/// Compiled regex cache for forbidden-parameter detection.
pub struct PatternMatcher {
    patterns: Vec<(regex::Regex, String)>,
}

impl PatternMatcher {
    /// Compile patterns. Invalid patterns are skipped with a warning.
    pub fn new(patterns: &[ForbiddenPattern]) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|p| match regex::Regex::new(&p.pattern) {
                Ok(re) => Some((re, p.label.clone())),
                Err(e) => {
                    tracing::warn!(
                        pattern = %p.pattern,
                        error = %e,
                        "Invalid forbidden pattern regex, skipping"
                    );
                    None
                }
            })
            .collect();
        Self { patterns: compiled }
    }

    /// Returns the label of the first pattern matching `value`.
    pub fn find(&self, value: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(value))
            .map(|(_, label)| label.as_str())
    }

    /// Walk every string inside a JSON value and return the first hit.
    pub fn find_in_value(&self, value: &serde_json::Value) -> Option<&str> {
        match value {
            serde_json::Value::String(s) => self.find(s),
            serde_json::Value::Array(items) => items.iter().find_map(|v| self.find_in_value(v)),
            serde_json::Value::Object(map) => map.values().find_map(|v| self.find_in_value(v)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Outcome of validating an action request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { reason: String, severity: Severity },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn denied(reason: impl Into<String>, severity: Severity) -> Self {
        Self::Denied {
            reason: reason.into(),
            severity,
        }
    }
}

/// Immutable audit record produced by every denial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub run_id: Option<String>,
    pub node: String,
    pub action: String,
    pub severity: Severity,
    pub reason: String,
    #[serde(default)]
    pub detail: Option<String>,
}
