use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ApprovalRequest, RunId, StateMap};

/// Approval channel — delivers approval prompts to humans.
///
/// Delivery itself (chat, email, paging) belongs to the embedding application.
pub trait ApprovalChannel: Send + Sync + 'static {
    /// Announce a new pending request.
    fn notify(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>>;

    /// Forward an unresolved request to a higher-authority channel.
    fn escalate(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>>;
}

/// State store — persistence backend for finished run state.
pub trait StateStore: Send + Sync + 'static {
    /// Persist the final state of a run (overwrites).
    fn save(&self, run_id: &RunId, state: &StateMap) -> BoxFuture<'_, Result<()>>;

    /// Load a previously persisted state.
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<StateMap>>>;
}
