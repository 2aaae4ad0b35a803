//! Graph Execution Engine: governed, stateful workflow orchestration.
//!
//! A workflow is a graph of `Node`s and `ParallelGroup`s joined by `Route`s.
//! `GraphBuilder::compile` validates the definition into an immutable
//! `CompiledGraph`, which any number of runs share.
//!
//! The `ExecutionEngine` walks the graph from its entry point. Every node
//! that declares an `ActionSpec` passes the guardrails, budget and circuit
//! breaker, and waits for human approval when its policy demands one, before
//! its executor is invoked. Nodes read an immutable `ExecutionState` snapshot
//! and return a delta; deltas are merged under the graph's `StateSchema`.

pub mod compile;
pub mod executor;
pub mod node;
pub mod route;
pub mod state;

pub use compile::{CompiledGraph, GraphBuilder, JoinMode, ParallelGroup};
pub use executor::{ExecutionEngine, FailureReport, FinalState, RunOptions, RunOutcome};
pub use node::{decode_action, ActionSpec, FnExecutor, Node, NodeExecutor, RetryPolicy};
pub use route::{evaluate_condition, ExprRouter, FnRouter, Route, Router, END};
pub use state::{ExecutionState, MergePolicy, StateSchema};
