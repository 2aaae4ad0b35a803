pub mod approval;
pub mod audit;
pub mod breaker;
pub mod budget;
pub mod governance;
pub mod graph;
pub mod guardrails;
pub mod orchestrator;
pub mod run_log;
pub mod store;
pub mod voting;

pub use approval::{ApprovalCoordinator, LoggingChannel};
pub use audit::{AuditJournal, AuditLog, AuditReader};
pub use breaker::{Admission, CircuitBreakers, CircuitSnapshot, CircuitState};
pub use budget::{BudgetStatus, BudgetTracker};
pub use governance::GovernanceContext;
pub use graph::{
    ActionSpec, CompiledGraph, ExecutionEngine, ExecutionState, ExprRouter, FailureReport,
    FinalState, GraphBuilder, JoinMode, MergePolicy, Node, NodeExecutor, ParallelGroup,
    RetryPolicy, Route, RunOptions, RunOutcome, StateSchema, END,
};
pub use guardrails::{PolicyEngine, PolicySnapshot};
pub use orchestrator::{Orchestrator, RunHandle};
pub use run_log::RunLogger;
pub use store::{MemoryStateStore, SqliteStateStore};
pub use voting::{Ballot, VoteOutcome, VoteResult, VoteSpec, VotingCoordinator, VotingStrategy};
