use std::sync::Arc;

use rpaflow_core::traits::{OrchestrationClient, StatusSink};
use rpaflow_core::{
    ExecutionId, ExecutionResults, ExecutionStatus, Result, RunState, StatusReport, StatusUpdate,
};
use tracing::{debug, info, warn};

/// Publishes lifecycle transitions to the orchestration substrate and
/// answers status and cancel queries against it.
///
/// Publishing is fire-and-forget: a sink failure is logged and never changes
/// the outcome of a run.
pub struct ExecutionStatusReporter {
    sink: Arc<dyn StatusSink>,
    client: Arc<dyn OrchestrationClient>,
}

impl ExecutionStatusReporter {
    pub fn new(sink: Arc<dyn StatusSink>, client: Arc<dyn OrchestrationClient>) -> Self {
        Self { sink, client }
    }

    pub async fn report_started(&self, id: &ExecutionId) {
        self.publish(StatusUpdate {
            execution_id: id.clone(),
            status: ExecutionStatus::Running,
            result: None,
            error: None,
        })
        .await;
    }

    pub async fn report_completed(&self, id: &ExecutionId, results: &ExecutionResults) {
        self.publish(StatusUpdate {
            execution_id: id.clone(),
            status: ExecutionStatus::Completed,
            result: Some(results.clone()),
            error: None,
        })
        .await;
    }

    pub async fn report_failed(&self, id: &ExecutionId, error: &str, partial: &ExecutionResults) {
        self.publish(StatusUpdate {
            execution_id: id.clone(),
            status: ExecutionStatus::Failed,
            result: Some(partial.clone()),
            error: Some(error.to_string()),
        })
        .await;
    }

    pub async fn report_canceled(&self, id: &ExecutionId, partial: &ExecutionResults) {
        self.publish(StatusUpdate {
            execution_id: id.clone(),
            status: ExecutionStatus::Canceled,
            result: Some(partial.clone()),
            error: None,
        })
        .await;
    }

    async fn publish(&self, update: StatusUpdate) {
        let execution_id = update.execution_id.clone();
        let status = update.status;
        match self.sink.publish(update).await {
            Ok(()) => debug!(execution_id = %execution_id, status = %status, "Status published"),
            Err(e) => warn!(
                execution_id = %execution_id,
                status = %status,
                error = %e,
                "Failed to publish status update"
            ),
        }
    }

    /// Current status of a run, with its return value or error once terminal.
    pub async fn get_status(&self, id: &ExecutionId) -> Result<StatusReport> {
        let description = self.client.describe(id).await?;

        let status = match description.state {
            RunState::Pending => ExecutionStatus::Pending,
            RunState::Running => ExecutionStatus::Running,
            RunState::Completed => ExecutionStatus::Completed,
            RunState::Failed | RunState::Terminated | RunState::TimedOut => ExecutionStatus::Failed,
            RunState::Canceled => ExecutionStatus::Canceled,
        };

        let error = match description.state {
            RunState::Failed => description.failure,
            RunState::Terminated => description
                .failure
                .or_else(|| Some("Run was terminated".into())),
            RunState::TimedOut => description
                .failure
                .or_else(|| Some("Run timed out".into())),
            _ => None,
        };
        let result = if status.is_terminal() {
            description.outcome
        } else {
            None
        };

        Ok(StatusReport {
            execution_id: id.clone(),
            status,
            result,
            error,
        })
    }

    /// Ask the substrate to cancel a run. `true` means the request was
    /// accepted, not that the run has stopped.
    pub async fn cancel(&self, id: &ExecutionId) -> Result<bool> {
        let accepted = self.client.cancel(id).await?;
        info!(execution_id = %id, accepted, "Cancellation requested");
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use rpaflow_core::{NodeExecutionResult, RpaError, RunDescription, RunOutcome, WorkflowId};
    use rpaflow_test_utils::{FailingSink, RecordingSink};
    use std::sync::Mutex;

    /// Substrate that answers `describe` with a fixed description.
    struct CannedClient {
        description: Mutex<Option<RunDescription>>,
        accept_cancel: bool,
    }

    impl CannedClient {
        fn new(state: RunState, outcome: Option<RunOutcome>, failure: Option<&str>) -> Self {
            Self {
                description: Mutex::new(Some(RunDescription {
                    state,
                    outcome,
                    failure: failure.map(str::to_string),
                })),
                accept_cancel: true,
            }
        }

        fn unknown() -> Self {
            Self {
                description: Mutex::new(None),
                accept_cancel: false,
            }
        }
    }

    impl OrchestrationClient for CannedClient {
        fn describe(&self, id: &ExecutionId) -> BoxFuture<'_, Result<RunDescription>> {
            let description = self.description.lock().unwrap().clone();
            let id = id.clone();
            Box::pin(async move {
                description.ok_or_else(|| RpaError::ExecutionNotFound(id.to_string()))
            })
        }

        fn cancel(&self, _id: &ExecutionId) -> BoxFuture<'_, Result<bool>> {
            let accepted = self.accept_cancel;
            Box::pin(async move { Ok(accepted) })
        }
    }

    fn status_reporter(client: CannedClient) -> (ExecutionStatusReporter, RecordingSink) {
        let sink = RecordingSink::new();
        let reporter = ExecutionStatusReporter::new(Arc::new(sink.clone()), Arc::new(client));
        (reporter, sink)
    }

    fn outcome(id: &ExecutionId) -> RunOutcome {
        let mut results = ExecutionResults::new();
        results.insert("start".into(), NodeExecutionResult::success());
        RunOutcome {
            execution_id: id.clone(),
            workflow_id: WorkflowId::from_string("wf"),
            status: ExecutionStatus::Completed,
            results,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_updates() {
        let (reporter, sink) = status_reporter(CannedClient::unknown());
        let id = ExecutionId::from_string("ex-1");
        let mut partial = ExecutionResults::new();
        partial.insert("start".into(), NodeExecutionResult::success());

        reporter.report_started(&id).await;
        reporter.report_failed(&id, "Workflow has no start node", &partial).await;

        assert_eq!(
            sink.statuses(),
            vec![ExecutionStatus::Running, ExecutionStatus::Failed]
        );
        let last = sink.last().unwrap();
        assert_eq!(last.error.as_deref(), Some("Workflow has no start node"));
        assert_eq!(last.result.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let reporter = ExecutionStatusReporter::new(
            Arc::new(FailingSink),
            Arc::new(CannedClient::unknown()),
        );
        let id = ExecutionId::new();
        reporter.report_started(&id).await;
        reporter.report_completed(&id, &ExecutionResults::new()).await;
    }

    #[tokio::test]
    async fn test_completed_includes_return_value() {
        let id = ExecutionId::from_string("ex-2");
        let (reporter, _) = status_reporter(CannedClient::new(
            RunState::Completed,
            Some(outcome(&id)),
            None,
        ));
        let report = reporter.get_status(&id).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.result.unwrap().results.len(), 1);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn test_state_mapping() {
        let id = ExecutionId::new();
        let cases = [
            (RunState::Pending, ExecutionStatus::Pending),
            (RunState::Running, ExecutionStatus::Running),
            (RunState::Failed, ExecutionStatus::Failed),
            (RunState::Terminated, ExecutionStatus::Failed),
            (RunState::TimedOut, ExecutionStatus::Failed),
            (RunState::Canceled, ExecutionStatus::Canceled),
        ];
        for (state, expected) in cases {
            let (reporter, _) = status_reporter(CannedClient::new(state, None, None));
            assert_eq!(reporter.get_status(&id).await.unwrap().status, expected);
        }
    }

    #[tokio::test]
    async fn test_failed_carries_error() {
        let id = ExecutionId::new();
        let (reporter, _) = status_reporter(CannedClient::new(
            RunState::Failed,
            None,
            Some("Node 'fetch' has no outgoing edge"),
        ));
        let report = reporter.get_status(&id).await.unwrap();
        assert_eq!(
            report.error.as_deref(),
            Some("Node 'fetch' has no outgoing edge")
        );

        let (reporter, _) = status_reporter(CannedClient::new(RunState::TimedOut, None, None));
        let report = reporter.get_status(&id).await.unwrap();
        assert_eq!(report.error.as_deref(), Some("Run timed out"));
    }

    #[tokio::test]
    async fn test_running_hides_result() {
        let id = ExecutionId::new();
        let (reporter, _) = status_reporter(CannedClient::new(
            RunState::Running,
            Some(outcome(&id)),
            None,
        ));
        assert!(reporter.get_status(&id).await.unwrap().result.is_none());
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let (reporter, _) = status_reporter(CannedClient::unknown());
        let err = reporter.get_status(&ExecutionId::from_string("nope")).await.unwrap_err();
        assert!(matches!(err, RpaError::ExecutionNotFound(_)));
        assert!(!reporter.cancel(&ExecutionId::new()).await.unwrap());
    }
}
