use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use rpaflow_core::traits::StatusSink;
use rpaflow_core::{ExecutionStatus, Result, RpaError, StatusUpdate};

/// A [`StatusSink`] that keeps every update it receives.
#[derive(Clone, Default)]
pub struct RecordingSink {
    updates: Arc<Mutex<Vec<StatusUpdate>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<ExecutionStatus> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|u| u.status)
            .collect()
    }

    pub fn last(&self) -> Option<StatusUpdate> {
        self.updates.lock().unwrap().last().cloned()
    }
}

impl StatusSink for RecordingSink {
    fn publish(&self, update: StatusUpdate) -> BoxFuture<'_, Result<()>> {
        self.updates.lock().unwrap().push(update);
        Box::pin(async { Ok(()) })
    }
}

/// A [`StatusSink`] whose channel is always down.
#[derive(Clone, Default)]
pub struct FailingSink;

impl StatusSink for FailingSink {
    fn publish(&self, _update: StatusUpdate) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(RpaError::Orchestration("status channel unavailable".into())) })
    }
}
