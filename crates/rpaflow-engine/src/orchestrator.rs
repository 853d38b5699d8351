//! In-process orchestration substrate.

use std::collections::HashMap;

use futures::future::BoxFuture;
use rpaflow_core::traits::{OrchestrationClient, StatusSink};
use rpaflow_core::{
    ExecutionId, ExecutionStatus, Result, RpaError, RunDescription, RunOutcome, RunRequest,
    RunState, StatusUpdate, WorkflowExecution,
};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct RunSlot {
    execution: WorkflowExecution,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<RunOutcome>>,
}

/// Tracks runs executing as tokio tasks in this process.
///
/// Acts as both halves of the substrate contract: it receives status updates
/// as a [`StatusSink`] and answers describe/cancel as an
/// [`OrchestrationClient`]. A run counts as terminal only once its outcome
/// has been recorded with [`LocalOrchestrator::finish`].
#[derive(Default)]
pub struct LocalOrchestrator {
    runs: Mutex<HashMap<ExecutionId, RunSlot>>,
}

impl LocalOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run and hand back the token that cancels it.
    pub async fn register(&self, request: &RunRequest) -> Result<CancellationToken> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&request.execution_id) {
            return Err(RpaError::Orchestration(format!(
                "Execution '{}' already exists",
                request.execution_id
            )));
        }

        let cancel = CancellationToken::new();
        let (outcome, _) = watch::channel(None);
        runs.insert(
            request.execution_id.clone(),
            RunSlot {
                execution: WorkflowExecution::new(
                    request.execution_id.clone(),
                    request.workflow_id.clone(),
                ),
                cancel: cancel.clone(),
                outcome,
            },
        );
        debug!(execution_id = %request.execution_id, "Run registered");
        Ok(cancel)
    }

    /// Record the return value of a finished run.
    pub async fn finish(&self, outcome: RunOutcome) {
        let mut runs = self.runs.lock().await;
        let Some(slot) = runs.get_mut(&outcome.execution_id) else {
            debug!(execution_id = %outcome.execution_id, "Outcome for unknown run dropped");
            return;
        };
        // Covers a run whose terminal status update never arrived.
        slot.execution.apply(&StatusUpdate {
            execution_id: outcome.execution_id.clone(),
            status: outcome.status,
            result: Some(outcome.results.clone()),
            error: outcome.error.clone(),
        });
        slot.outcome.send_replace(Some(outcome));
    }

    /// Wait for a run's outcome.
    pub async fn wait(&self, id: &ExecutionId) -> Result<RunOutcome> {
        let mut rx = {
            let runs = self.runs.lock().await;
            runs.get(id)
                .ok_or_else(|| RpaError::ExecutionNotFound(id.to_string()))?
                .outcome
                .subscribe()
        };
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RpaError::Orchestration(format!("Run '{id}' was dropped")))?;
        outcome
            .clone()
            .ok_or_else(|| RpaError::Orchestration(format!("Run '{id}' has no outcome")))
    }

    /// Drop a finished run's record and results.
    ///
    /// Returns false when the run is unknown or still in flight; in-flight
    /// runs are kept so their status and cancellation keep working.
    pub async fn forget(&self, id: &ExecutionId) -> bool {
        let mut runs = self.runs.lock().await;
        let finished = runs
            .get(id)
            .is_some_and(|slot| slot.outcome.borrow().is_some());
        if finished {
            runs.remove(id);
            debug!(execution_id = %id, "Run forgotten");
        }
        finished
    }

    /// Number of runs currently tracked, finished or not.
    pub async fn tracked(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Snapshot of the tracked execution record.
    pub async fn execution(&self, id: &ExecutionId) -> Option<WorkflowExecution> {
        self.runs
            .lock()
            .await
            .get(id)
            .map(|slot| slot.execution.clone())
    }
}

impl StatusSink for LocalOrchestrator {
    fn publish(&self, update: StatusUpdate) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut runs = self.runs.lock().await;
            let slot = runs
                .get_mut(&update.execution_id)
                .ok_or_else(|| RpaError::ExecutionNotFound(update.execution_id.to_string()))?;
            if !slot.execution.apply(&update) {
                debug!(
                    execution_id = %update.execution_id,
                    status = %update.status,
                    "Ignoring update after terminal status"
                );
            }
            Ok(())
        })
    }
}

impl OrchestrationClient for LocalOrchestrator {
    fn describe(&self, id: &ExecutionId) -> BoxFuture<'_, Result<RunDescription>> {
        let id = id.clone();
        Box::pin(async move {
            let runs = self.runs.lock().await;
            let slot = runs
                .get(&id)
                .ok_or_else(|| RpaError::ExecutionNotFound(id.to_string()))?;

            let outcome = slot.outcome.borrow().clone();
            let state = match (&outcome, slot.execution.status) {
                (None, ExecutionStatus::Pending) => RunState::Pending,
                (None, _) => RunState::Running,
                (Some(o), _) => match o.status {
                    ExecutionStatus::Completed => RunState::Completed,
                    ExecutionStatus::Canceled => RunState::Canceled,
                    _ => RunState::Failed,
                },
            };
            let failure = outcome.as_ref().and_then(|o| o.error.clone());

            Ok(RunDescription {
                state,
                outcome,
                failure,
            })
        })
    }

    fn cancel(&self, id: &ExecutionId) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move {
            let runs = self.runs.lock().await;
            let slot = runs
                .get(&id)
                .ok_or_else(|| RpaError::ExecutionNotFound(id.to_string()))?;
            if slot.outcome.borrow().is_some() {
                return Ok(false);
            }
            slot.cancel.cancel();
            Ok(true)
        })
    }
}
