use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use marshal_core::config::RetryConfig;
use marshal_core::error::{MarshalError, Result};
use marshal_core::policy::{RiskLevel, Urgency};
use marshal_core::types::{ActionRequest, StateDelta};

use super::state::ExecutionState;

/// The capability every node provides: read a state snapshot, return the
/// keys it wants to write.
pub trait NodeExecutor: Send + Sync + 'static {
    fn execute(&self, state: ExecutionState) -> BoxFuture<'_, Result<StateDelta>>;
}

/// Adapts an async closure into a [`NodeExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(ExecutionState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateDelta>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> NodeExecutor for FnExecutor<F>
where
    F: Fn(ExecutionState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateDelta>> + Send + 'static,
{
    fn execute(&self, state: ExecutionState) -> BoxFuture<'_, Result<StateDelta>> {
        Box::pin((self.f)(state))
    }
}

/// Side effect a node performs, used to build its `ActionRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Policy lookup key.
    pub action: String,
    #[serde(default)]
    pub estimated_cost_cents: u64,
    /// State keys copied into the request parameters.
    #[serde(default)]
    pub param_keys: Vec<String>,
    /// State keys holding the resources the action touches.
    #[serde(default)]
    pub resource_keys: Vec<String>,
    #[serde(default)]
    pub urgency: Option<Urgency>,
    #[serde(default)]
    pub risk: Option<RiskLevel>,
    /// Budget periods charged in addition to the run's own.
    #[serde(default)]
    pub budget_keys: Vec<String>,
}

impl ActionSpec {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            estimated_cost_cents: 0,
            param_keys: vec![],
            resource_keys: vec![],
            urgency: None,
            risk: None,
            budget_keys: vec![],
        }
    }

    pub fn with_cost(mut self, cents: u64) -> Self {
        self.estimated_cost_cents = cents;
        self
    }

    pub fn with_params(mut self, keys: Vec<String>) -> Self {
        self.param_keys = keys;
        self
    }

    pub fn with_resources(mut self, keys: Vec<String>) -> Self {
        self.resource_keys = keys;
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = Some(urgency);
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = Some(risk);
        self
    }

    pub fn with_budget_keys(mut self, keys: Vec<String>) -> Self {
        self.budget_keys = keys;
        self
    }

    /// Build the request for `node` from a state snapshot.
    pub fn to_request(
        &self,
        run_id: &str,
        node: &str,
        state: &ExecutionState,
        run_budget_keys: &[String],
    ) -> ActionRequest {
        let mut req = ActionRequest::new(node, self.action.clone()).with_cost(self.estimated_cost_cents);
        req.run_id = Some(run_id.to_string());
        req.risk = self.risk.unwrap_or_default();
        for key in &self.param_keys {
            if let Some(value) = state.get(key) {
                req.parameters.insert(key.clone(), value.clone());
            }
        }
        for key in &self.resource_keys {
            match state.get(key) {
                Some(serde_json::Value::String(s)) => req.resources.push(s.clone()),
                Some(serde_json::Value::Array(items)) => req
                    .resources
                    .extend(items.iter().filter_map(|v| v.as_str().map(String::from))),
                _ => {}
            }
        }
        let mut keys = run_budget_keys.to_vec();
        for k in &self.budget_keys {
            if !keys.contains(k) {
                keys.push(k.clone());
            }
        }
        req.budget_keys = keys;
        req
    }
}

/// Bounded retries with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_jitter() -> bool {
    true
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self::from_config(&RetryConfig {
            max_attempts,
            ..Default::default()
        })
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            jitter: true,
        }
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        if !self.jitter {
            return Duration::from_millis(ms);
        }
        // 0.8x to 1.2x
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }
}

/// A unit of work in the graph.
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub executor: Arc<dyn NodeExecutor>,
    pub action: Option<ActionSpec>,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    /// Target taken when the node fails terminally.
    pub fallback: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, executor: Arc<dyn NodeExecutor>) -> Self {
        Self {
            name: name.into(),
            executor,
            action: None,
            retry: None,
            timeout: None,
            fallback: None,
        }
    }

    /// Node backed by an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ExecutionState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StateDelta>> + Send + 'static,
    {
        Self::new(name, Arc::new(FnExecutor::new(f)))
    }

    pub fn with_action(mut self, action: ActionSpec) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_fallback(mut self, target: impl Into<String>) -> Self {
        self.fallback = Some(target.into());
        self
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("action", &self.action)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// Strictly decode a reasoning step's raw output into an action payload.
pub fn decode_action<T: DeserializeOwned>(node: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw.trim()).map_err(|e| MarshalError::MalformedAction {
        node: node.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct NextAction {
        tool: String,
        args: Vec<String>,
    }

    #[test]
    fn decode_action_is_strict() {
        let ok: NextAction =
            decode_action("plan", r#" {"tool": "git", "args": ["status"]} "#).unwrap();
        assert_eq!(ok.tool, "git");
        assert_eq!(ok.args, vec!["status"]);

        let err = decode_action::<NextAction>("plan", r#"{"tool": "git", "args": [], "x": 1}"#)
            .unwrap_err();
        assert!(matches!(err, MarshalError::MalformedAction { ref node, .. } if node == "plan"));
        assert!(err.is_retryable());

        assert!(decode_action::<NextAction>("plan", "Sure! Let me run git.").is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy::new(5).with_backoff(100, 1_000).without_jitter();
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1_000));
        assert_eq!(p.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = RetryPolicy::new(3).with_backoff(1_000, 10_000);
        for _ in 0..50 {
            let d = p.backoff(0).as_millis();
            assert!((800..=1_200).contains(&d), "{}", d);
        }
    }

    #[test]
    fn request_built_from_state() {
        let mut data = marshal_core::types::StateMap::new();
        data.insert("cmd".into(), json!("make test"));
        data.insert("paths".into(), json!(["/workspace/a", "/workspace/b"]));
        let state = ExecutionState::from_map(data);

        let spec = ActionSpec::new("run_command")
            .with_cost(12)
            .with_params(vec!["cmd".into(), "missing".into()])
            .with_resources(vec!["paths".into()])
            .with_risk(RiskLevel::High)
            .with_budget_keys(vec!["daily".into()]);
        let req = spec.to_request("r1", "test", &state, &["daily".into(), "monthly".into()]);

        assert_eq!(req.run_id.as_deref(), Some("r1"));
        assert_eq!(req.parameters.len(), 1);
        assert_eq!(req.resources, vec!["/workspace/a", "/workspace/b"]);
        assert_eq!(req.risk, RiskLevel::High);
        assert_eq!(req.estimated_cost_cents, 12);
        assert_eq!(req.budget_keys, vec!["daily", "monthly"]);
    }
}
