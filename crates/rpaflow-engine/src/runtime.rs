use std::sync::Arc;

use rpaflow_browser::SessionManager;
use rpaflow_core::{
    AppConfig, EventBus, ExecutionId, Result, RunOutcome, RunRequest, StatusReport,
};
use tracing::{debug, info};

use crate::dispatcher::NodeDispatcher;
use crate::interpreter::WorkflowInterpreter;
use crate::orchestrator::LocalOrchestrator;
use crate::reporter::ExecutionStatusReporter;

/// Wires the interpreter to the in-process substrate.
///
/// Each started run gets its own tokio task and cancellation token. All runs
/// share one browser session manager and one event bus.
pub struct Engine {
    interpreter: Arc<WorkflowInterpreter>,
    orchestrator: Arc<LocalOrchestrator>,
    reporter: Arc<ExecutionStatusReporter>,
    event_bus: Arc<EventBus>,
    sessions: Arc<dyn SessionManager>,
}

impl Engine {
    pub fn new(config: &AppConfig, sessions: Arc<dyn SessionManager>) -> Result<Self> {
        let orchestrator = Arc::new(LocalOrchestrator::new());
        let reporter = Arc::new(ExecutionStatusReporter::new(
            orchestrator.clone(),
            orchestrator.clone(),
        ));
        let event_bus = Arc::new(EventBus::new(config.events.capacity));
        let dispatcher = Arc::new(NodeDispatcher::new(
            sessions.clone(),
            &config.http,
            &config.script,
        )?);
        let interpreter = Arc::new(WorkflowInterpreter::new(
            dispatcher,
            reporter.clone(),
            event_bus.clone(),
            config.engine.revisit_policy,
        ));

        debug!(revisit_policy = ?config.engine.revisit_policy, "Engine initialized");
        Ok(Self {
            interpreter,
            orchestrator,
            reporter,
            event_bus,
            sessions,
        })
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn orchestrator(&self) -> &Arc<LocalOrchestrator> {
        &self.orchestrator
    }

    /// Start a run in the background and return its id.
    pub async fn start(&self, request: RunRequest) -> Result<ExecutionId> {
        let cancel = self.orchestrator.register(&request).await?;
        let execution_id = request.execution_id.clone();

        let interpreter = self.interpreter.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let outcome = interpreter.run(request, cancel).await;
            orchestrator.finish(outcome).await;
        });

        info!(execution_id = %execution_id, "Run scheduled");
        Ok(execution_id)
    }

    /// Start a run and wait for its outcome.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let id = self.start(request).await?;
        self.wait(&id).await
    }

    pub async fn wait(&self, id: &ExecutionId) -> Result<RunOutcome> {
        self.orchestrator.wait(id).await
    }

    pub async fn status(&self, id: &ExecutionId) -> Result<StatusReport> {
        self.reporter.get_status(id).await
    }

    pub async fn cancel(&self, id: &ExecutionId) -> Result<bool> {
        self.reporter.cancel(id).await
    }

    /// Release a finished run's retained results. Returns false while the
    /// run is still in flight.
    pub async fn forget(&self, id: &ExecutionId) -> bool {
        self.orchestrator.forget(id).await
    }

    /// Close the shared browser session.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        info!("Engine shut down");
    }
}
