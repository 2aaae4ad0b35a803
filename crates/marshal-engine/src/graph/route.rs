use std::sync::Arc;

use marshal_core::error::Result;
use marshal_core::types::StateMap;

use super::state::ExecutionState;

/// Terminal sentinel. Always a legal routing target.
pub const END: &str = "__end__";

/// Picks the next target(s) from the state after a node or group finishes.
pub trait Router: Send + Sync + 'static {
    fn route(&self, state: &ExecutionState) -> Result<Vec<String>>;
}

/// Adapts a closure into a [`Router`].
pub struct FnRouter<F> {
    f: F,
}

impl<F> FnRouter<F>
where
    F: Fn(&ExecutionState) -> Vec<String> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Router for FnRouter<F>
where
    F: Fn(&ExecutionState) -> Vec<String> + Send + Sync + 'static,
{
    fn route(&self, state: &ExecutionState) -> Result<Vec<String>> {
        Ok((self.f)(state))
    }
}

/// Outgoing transition of a node or parallel group.
#[derive(Clone)]
pub enum Route {
    Direct(String),
    End,
    /// The router's answer must be a subset of `candidates` (plus [`END`]).
    Conditional {
        candidates: Vec<String>,
        router: Arc<dyn Router>,
    },
}

impl Route {
    pub fn to(target: impl Into<String>) -> Self {
        Self::Direct(target.into())
    }

    pub fn conditional(candidates: Vec<String>, router: Arc<dyn Router>) -> Self {
        Self::Conditional { candidates, router }
    }

    /// Conditional route driven by an expression router. Candidates are the
    /// router's rule targets and default.
    pub fn expr(router: ExprRouter) -> Self {
        let candidates = router.targets();
        Self::Conditional {
            candidates,
            router: Arc::new(router),
        }
    }

    /// Every statically declared target.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Direct(t) => vec![t.as_str()],
            Self::End => vec![],
            Self::Conditional { candidates, .. } => candidates.iter().map(String::as_str).collect(),
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(t) => f.debug_tuple("Direct").field(t).finish(),
            Self::End => f.write_str("End"),
            Self::Conditional { candidates, .. } => f
                .debug_struct("Conditional")
                .field("candidates", candidates)
                .finish_non_exhaustive(),
        }
    }
}

/// Rule-based router: the first matching expression wins, else `default`.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
#[derive(Debug, Clone)]
pub struct ExprRouter {
    rules: Vec<(String, String)>,
    default: String,
}

impl ExprRouter {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default: default.into(),
        }
    }

    pub fn when(mut self, expr: impl Into<String>, target: impl Into<String>) -> Self {
        self.rules.push((expr.into(), target.into()));
        self
    }

    pub fn targets(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for t in self
            .rules
            .iter()
            .map(|(_, t)| t)
            .chain(std::iter::once(&self.default))
        {
            if t != END && !out.contains(t) {
                out.push(t.clone());
            }
        }
        out
    }
}

impl Router for ExprRouter {
    fn route(&self, state: &ExecutionState) -> Result<Vec<String>> {
        let target = self
            .rules
            .iter()
            .find(|(expr, _)| evaluate_condition(expr, state.data()))
            .map(|(_, t)| t.clone())
            .unwrap_or_else(|| self.default.clone());
        Ok(vec![target])
    }
}

/// Evaluate a simple conditional expression against state.
///
/// Returns `false` for unparseable expressions and non-string values.
pub fn evaluate_condition(expr: &str, state: &StateMap) -> bool {
    let expr = expr.trim();

    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return state
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.contains(substr));
    }

    if let Some((key, value)) = parse_operator(expr, "!=") {
        return state
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s != value);
    }

    if let Some((key, value)) = parse_operator(expr, "==") {
        return state
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s == value);
    }

    false
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, serde_json::Value)]) -> ExecutionState {
        ExecutionState::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn conditions() {
        let s = state(&[
            ("status", json!("success")),
            ("output", json!("The file was created successfully.")),
            ("count", json!(3)),
        ]);
        assert!(evaluate_condition(r#"status == "success""#, s.data()));
        assert!(!evaluate_condition(r#"status == "failure""#, s.data()));
        assert!(evaluate_condition(r#"status != "failure""#, s.data()));
        assert!(evaluate_condition(r#"output contains "created""#, s.data()));
        assert!(!evaluate_condition(r#"output contains "deleted""#, s.data()));
        assert!(!evaluate_condition(r#"missing == "value""#, s.data()));
        assert!(!evaluate_condition(r#"count == "3""#, s.data()));
        assert!(!evaluate_condition("this is not valid", s.data()));
    }

    #[test]
    fn expr_router_first_match_wins() {
        let router = ExprRouter::new(END)
            .when(r#"verdict == "reject""#, "rework")
            .when(r#"verdict != "approve""#, "review")
            .when(r#"verdict == "reject""#, "never");
        assert_eq!(router.targets(), vec!["rework", "review", "never"]);

        let s = state(&[("verdict", json!("reject"))]);
        assert_eq!(router.route(&s).unwrap(), vec!["rework"]);
        let s = state(&[("verdict", json!("approve"))]);
        assert_eq!(router.route(&s).unwrap(), vec![END]);
    }

    #[test]
    fn route_targets() {
        assert_eq!(Route::to("b").targets(), vec!["b"]);
        assert!(Route::End.targets().is_empty());
        let r = Route::expr(ExprRouter::new("done").when(r#"x == "y""#, "retry"));
        assert_eq!(r.targets(), vec!["retry", "done"]);
        let r = Route::conditional(
            vec!["a".into(), "b".into()],
            Arc::new(FnRouter::new(|_| vec!["a".into(), "b".into()])),
        );
        assert_eq!(r.targets(), vec!["a", "b"]);
    }
}
