use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use marshal_core::types::{StateDelta, StateMap};

/// How a key's incoming value combines with the current one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Overwrite the current value.
    #[default]
    Replace,
    /// Concatenate onto the current list.
    Append,
    /// Union with the current list, keeping first-seen order.
    AccumulateSet,
}

/// Declared merge policy per state key. Undeclared keys use `Replace`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSchema {
    policies: HashMap<String, MergePolicy>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(mut self, key: impl Into<String>, policy: MergePolicy) -> Self {
        self.policies.insert(key.into(), policy);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, policy: MergePolicy) {
        self.policies.insert(key.into(), policy);
    }

    pub fn policy_for(&self, key: &str) -> MergePolicy {
        self.policies.get(key).copied().unwrap_or_default()
    }
}

/// Run state shared between graph nodes.
///
/// Every applied delta bumps `version`, which step records use to identify
/// the snapshot a node read.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionState {
    data: StateMap,
    version: u64,
    #[serde(skip)]
    schema: Arc<StateSchema>,
}

impl ExecutionState {
    pub fn new(schema: Arc<StateSchema>, initial: StateMap) -> Self {
        Self {
            data: initial,
            version: 0,
            schema,
        }
    }

    /// State with no declared merge policies.
    pub fn from_map(data: StateMap) -> Self {
        Self::new(Arc::new(StateSchema::default()), data)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn data(&self) -> &StateMap {
        &self.data
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn into_data(self) -> StateMap {
        self.data
    }

    /// Merge one node's output into the state.
    pub fn apply(&mut self, delta: &StateDelta) {
        for (key, value) in delta {
            match self.schema.policy_for(key) {
                MergePolicy::Replace => {
                    self.data.insert(key.clone(), value.clone());
                }
                MergePolicy::Append => {
                    let mut items = self.data.remove(key).map(into_items).unwrap_or_default();
                    items.extend(into_items(value.clone()));
                    self.data.insert(key.clone(), serde_json::Value::Array(items));
                }
                MergePolicy::AccumulateSet => {
                    let mut items = self.data.remove(key).map(into_items).unwrap_or_default();
                    for item in into_items(value.clone()) {
                        if !items.contains(&item) {
                            items.push(item);
                        }
                    }
                    self.data.insert(key.clone(), serde_json::Value::Array(items));
                }
            }
        }
        self.version += 1;
    }

    /// Merge parallel branch outputs given in branch priority order.
    ///
    /// `replace` keeps the first-listed writer, `append` concatenates in
    /// priority order, `accumulate_set` unions in first-seen order.
    pub fn merge_parallel(&mut self, deltas: &[StateDelta]) {
        let mut combined = StateDelta::new();
        for delta in deltas {
            let mut keys: Vec<&String> = delta.keys().collect();
            keys.sort();
            for key in keys {
                let value = &delta[key];
                match self.schema.policy_for(key) {
                    MergePolicy::Replace => {
                        combined
                            .entry(key.clone())
                            .or_insert_with(|| value.clone());
                    }
                    MergePolicy::Append | MergePolicy::AccumulateSet => {
                        let slot = combined
                            .entry(key.clone())
                            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
                        if let serde_json::Value::Array(items) = slot {
                            items.extend(into_items(value.clone()));
                        }
                    }
                }
            }
        }
        self.apply(&combined);
    }
}

fn into_items(value: serde_json::Value) -> Vec<serde_json::Value> {
    match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Null => Vec::new(),
        other => vec![other],
    }
}
