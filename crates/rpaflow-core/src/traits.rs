use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ExecutionId, RunDescription, StatusUpdate};

/// Status channel of the orchestration substrate (fire-and-forget).
pub trait StatusSink: Send + Sync + 'static {
    /// Push a lifecycle transition for an execution.
    fn publish(&self, update: StatusUpdate) -> BoxFuture<'_, Result<()>>;
}

/// Query/control side of the orchestration substrate.
pub trait OrchestrationClient: Send + Sync + 'static {
    /// Describe a run: its state plus, when terminal, its return value or error.
    fn describe(&self, id: &ExecutionId) -> BoxFuture<'_, Result<RunDescription>>;

    /// Request cooperative cancellation.
    /// Returns whether the request was accepted, not whether the run stopped.
    fn cancel(&self, id: &ExecutionId) -> BoxFuture<'_, Result<bool>>;
}
