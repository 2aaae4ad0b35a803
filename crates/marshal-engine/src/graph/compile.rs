use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use marshal_core::error::{MarshalError, Result};

use super::node::Node;
use super::route::{Route, END};
use super::state::{MergePolicy, StateSchema};
use crate::voting::VoteSpec;

/// How a parallel group treats branch failures at fan-in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Any failed branch fails the group.
    #[default]
    RequireAll,
    /// Successful branches merge; the group fails only if all failed.
    BestEffort,
}

/// Nodes that fan out together and fan in at a barrier.
#[derive(Debug, Clone)]
pub struct ParallelGroup {
    pub name: String,
    /// Branch node names. Order is merge priority.
    pub branches: Vec<String>,
    pub join: JoinMode,
    pub max_concurrency: Option<usize>,
    pub vote: Option<VoteSpec>,
    pub route: Route,
    pub fallback: Option<String>,
}

impl ParallelGroup {
    pub fn new(name: impl Into<String>, branches: Vec<String>) -> Self {
        Self {
            name: name.into(),
            branches,
            join: JoinMode::RequireAll,
            max_concurrency: None,
            vote: None,
            route: Route::End,
            fallback: None,
        }
    }

    pub fn best_effort(mut self) -> Self {
        self.join = JoinMode::BestEffort;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn with_vote(mut self, vote: VoteSpec) -> Self {
        self.vote = Some(vote);
        self
    }

    pub fn then(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    pub fn with_fallback(mut self, target: impl Into<String>) -> Self {
        self.fallback = Some(target.into());
        self
    }
}

/// Collects nodes, groups and routes, then validates them into a
/// [`CompiledGraph`].
pub struct GraphBuilder {
    id: String,
    nodes: Vec<Node>,
    groups: Vec<ParallelGroup>,
    routes: Vec<(String, Route)>,
    entry: Option<String>,
    schema: StateSchema,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
            groups: Vec::new(),
            routes: Vec::new(),
            entry: None,
            schema: StateSchema::new(),
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn group(mut self, group: ParallelGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Unconditional transition. `to` may be [`END`].
    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let to = to.into();
        let route = if to == END { Route::End } else { Route::Direct(to) };
        self.route(from, route)
    }

    pub fn route(mut self, from: impl Into<String>, route: Route) -> Self {
        self.routes.push((from.into(), route));
        self
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    pub fn merge_policy(mut self, key: impl Into<String>, policy: MergePolicy) -> Self {
        self.schema.insert(key, policy);
        self
    }

    pub fn compile(self) -> Result<CompiledGraph> {
        let err = |msg: String| Err(MarshalError::GraphDefinition(msg));

        let mut names = HashSet::new();
        for name in self
            .nodes
            .iter()
            .map(|n| &n.name)
            .chain(self.groups.iter().map(|g| &g.name))
        {
            if name == END {
                return err(format!("'{}' is reserved", END));
            }
            if name.is_empty() {
                return err("empty node name".into());
            }
            if !names.insert(name.clone()) {
                return err(format!("duplicate name '{}'", name));
            }
        }

        let nodes: HashMap<String, Node> = self
            .nodes
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect();
        let group_names: HashSet<&String> = self.groups.iter().map(|g| &g.name).collect();
        let target_ok = |t: &str| t == END || names.contains(t);

        let entry = match self.entry {
            Some(e) if names.contains(&e) => e,
            Some(e) => return err(format!("entry point '{}' is not defined", e)),
            None => return err("no entry point".into()),
        };

        let mut routes = HashMap::new();
        for (from, route) in self.routes {
            if !nodes.contains_key(&from) {
                return err(format!(
                    "route from '{}': not a node (groups declare their route inline)",
                    from
                ));
            }
            if let Some(t) = route.targets().into_iter().find(|t| !target_ok(t)) {
                return err(format!("route from '{}' targets unknown '{}'", from, t));
            }
            if routes.insert(from.clone(), route).is_some() {
                return err(format!("'{}' declares more than one route", from));
            }
        }

        for node in nodes.values() {
            if let Some(fb) = &node.fallback {
                if !names.contains(fb) {
                    return err(format!("fallback of '{}' targets unknown '{}'", node.name, fb));
                }
            }
        }

        let mut branch_nodes = HashSet::new();
        for group in &self.groups {
            if group.branches.is_empty() {
                return err(format!("group '{}' has no branches", group.name));
            }
            for branch in &group.branches {
                if group_names.contains(branch) {
                    return err(format!(
                        "group '{}' nests group '{}'",
                        group.name, branch
                    ));
                }
                let Some(node) = nodes.get(branch) else {
                    return err(format!(
                        "group '{}' references unknown branch '{}'",
                        group.name, branch
                    ));
                };
                if routes.contains_key(branch) {
                    return err(format!(
                        "branch '{}' of group '{}' declares its own route",
                        branch, group.name
                    ));
                }
                if node.fallback.is_some() {
                    return err(format!(
                        "branch '{}' of group '{}' declares a fallback",
                        branch, group.name
                    ));
                }
                branch_nodes.insert(branch.clone());
            }
            if let Some(t) = group.route.targets().into_iter().find(|t| !target_ok(t)) {
                return err(format!("route from group '{}' targets unknown '{}'", group.name, t));
            }
            if let Some(fb) = &group.fallback {
                if !names.contains(fb) {
                    return err(format!("fallback of group '{}' targets unknown '{}'", group.name, fb));
                }
            }
            if group.max_concurrency == Some(0) {
                return err(format!("group '{}' has zero concurrency", group.name));
            }
        }

        let groups = self
            .groups
            .into_iter()
            .map(|g| (g.name.clone(), g))
            .collect();

        Ok(CompiledGraph {
            id: self.id,
            nodes,
            groups,
            routes,
            entry,
            schema: Arc::new(self.schema),
        })
    }
}

/// Validated, immutable graph, shared by `Arc` across runs.
#[derive(Debug)]
pub struct CompiledGraph {
    pub id: String,
    nodes: HashMap<String, Node>,
    groups: HashMap<String, ParallelGroup>,
    routes: HashMap<String, Route>,
    entry: String,
    schema: Arc<StateSchema>,
}

impl CompiledGraph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn group(&self, name: &str) -> Option<&ParallelGroup> {
        self.groups.get(name)
    }

    /// Route out of a node. Nodes without one are terminal.
    pub fn route_of(&self, name: &str) -> &Route {
        static END_ROUTE: Route = Route::End;
        if let Some(g) = self.groups.get(name) {
            return &g.route;
        }
        self.routes.get(name).unwrap_or(&END_ROUTE)
    }

    pub fn fallback_of(&self, name: &str) -> Option<&str> {
        match self.groups.get(name) {
            Some(g) => g.fallback.as_deref(),
            None => self.nodes.get(name).and_then(|n| n.fallback.as_deref()),
        }
    }

    pub fn schema(&self) -> Arc<StateSchema> {
        self.schema.clone()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
