use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MarshalError, Result};
use crate::policy::{PolicyTable, Urgency};

/// Top-level Marshal configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Action identifier → guardrail rules.
    #[serde(default)]
    pub policies: PolicyTable,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Step ceiling applied when a run does not set its own.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Upper bound on concurrently executing parallel branches.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Per-node timeout override; unset means scale by risk level.
    #[serde(default)]
    pub node_timeout_secs: Option<u64>,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            worker_pool_size: default_worker_pool_size(),
            node_timeout_secs: None,
            workspace: default_workspace(),
            retry: RetryConfig::default(),
        }
    }
}

/// Default retry policy for nodes that declare retries without tuning them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// Approval lifetimes per urgency, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_low_secs")]
    pub low_secs: u64,
    #[serde(default = "default_normal_secs")]
    pub normal_secs: u64,
    #[serde(default = "default_high_secs")]
    pub high_secs: u64,
    #[serde(default = "default_critical_secs")]
    pub critical_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            low_secs: default_low_secs(),
            normal_secs: default_normal_secs(),
            high_secs: default_high_secs(),
            critical_secs: default_critical_secs(),
        }
    }
}

impl ApprovalConfig {
    pub fn timeout_for(&self, urgency: Urgency) -> Duration {
        let secs = match urgency {
            Urgency::Low => self.low_secs,
            Urgency::Normal => self.normal_secs,
            Urgency::High => self.high_secs,
            Urgency::Critical => self.critical_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Wall-clock window a budget period covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetWindow {
    Hour,
    Day,
    Week,
    Month,
}

impl std::fmt::Display for BudgetWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
            Self::Week => write!(f, "week"),
            Self::Month => write!(f, "month"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub periods: Vec<BudgetPeriodConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetPeriodConfig {
    /// Key runs and actions refer to, e.g. "daily".
    pub key: String,
    pub window: BudgetWindow,
    pub limit_cents: u64,
    /// Percentages of the limit at which a warning fires (once per period).
    #[serde(default = "default_warn_thresholds")]
    pub warn_thresholds: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    #[serde(default = "default_breaker_cooldown")]
    pub cooldown_secs: u64,
    /// Per-action overrides.
    #[serde(default)]
    pub actions: HashMap<String, BreakerOverride>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            cooldown_secs: default_breaker_cooldown(),
            actions: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerOverride {
    #[serde(default)]
    pub threshold: Option<u32>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

impl BreakerConfig {
    /// Threshold and cooldown in effect for an action.
    pub fn settings_for(&self, action: &str) -> (u32, Duration) {
        let ov = self.actions.get(action);
        let threshold = ov.and_then(|o| o.threshold).unwrap_or(self.threshold).max(1);
        let cooldown = ov
            .and_then(|o| o.cooldown_secs)
            .unwrap_or(self.cooldown_secs);
        (threshold, Duration::from_secs(cooldown))
    }
}

/// Persistence of the audit trail and finished run state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// SQLite file for violations and step records. Unset = in-memory only.
    #[serde(default)]
    pub journal_path: Option<String>,
    /// SQLite file for final run states. Unset = states are discarded.
    #[serde(default)]
    pub state_path: Option<String>,
}

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run and governance events, 2 = adds node events.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 1 }
fn default_max_steps() -> usize { 50 }
fn default_worker_pool_size() -> usize { 4 }
fn default_workspace() -> String { "~/.marshal".to_string() }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 30_000 }
fn default_low_secs() -> u64 { 24 * 3600 }
fn default_normal_secs() -> u64 { 4 * 3600 }
fn default_high_secs() -> u64 { 3600 }
fn default_critical_secs() -> u64 { 15 * 60 }
fn default_warn_thresholds() -> Vec<u8> { vec![80] }
fn default_breaker_threshold() -> u32 { 5 }
fn default_breaker_cooldown() -> u64 { 60 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MarshalError::ConfigNotFound(path.display().to_string()))?;

        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| MarshalError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    /// Directory the JSONL run logger writes to.
    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_deref()) {
            Some(dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        }
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
