use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{WorkflowEdge, WorkflowNode};

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique workflow definition identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Outcome of a single node.
///
/// Serializes flat: `{"success": true, ..payload}` or
/// `{"success": false, "error": ".."}`. Node failures are always data,
/// never an error value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl NodeExecutionResult {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            data: serde_json::Map::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: serde_json::Map::new(),
        }
    }

    /// Attach a payload field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// The flat JSON form used when exposing results to conditions and scripts.
    pub fn to_value(&self) -> serde_json::Value {
        let mut obj = self.data.clone();
        obj.insert("success".into(), serde_json::Value::Bool(self.success));
        if let Some(ref e) = self.error {
            obj.insert("error".into(), serde_json::Value::String(e.clone()));
        }
        serde_json::Value::Object(obj)
    }
}

/// Per-node results of one execution, in visitation order.
pub type ExecutionResults = IndexMap<String, NodeExecutionResult>;

/// One run of a workflow, as tracked by the status layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new(id: ExecutionId, workflow_id: WorkflowId) -> Self {
        Self {
            id,
            workflow_id,
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            result: None,
            error: None,
        }
    }

    /// Apply a status update. Updates after a terminal status are ignored;
    /// returns whether the update was applied.
    pub fn apply(&mut self, update: &StatusUpdate) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = update.status;
        if update.result.is_some() {
            self.result = update.result.clone();
        }
        if update.error.is_some() {
            self.error = update.error.clone();
        }
        if update.status.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        true
    }
}

/// A request to run a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub workflow_id: WorkflowId,
    pub execution_id: ExecutionId,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Final outcome of a run.
///
/// `results` holds whatever node results accumulated, including the partial
/// results of a failed or canceled run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub results: ExecutionResults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A lifecycle transition pushed to the orchestration substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Answer to a status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run state as reported by a durable orchestration substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
    TimedOut,
}

/// The substrate's description of one run.
#[derive(Debug, Clone)]
pub struct RunDescription {
    pub state: RunState,
    /// Return value of a completed run.
    pub outcome: Option<RunOutcome>,
    /// Captured error of a failed run.
    pub failure: Option<String>,
}

/// Execution event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started.
    RunStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
    },
    /// A node is about to execute.
    NodeStarted {
        execution_id: ExecutionId,
        node_id: String,
        node_type: &'static str,
    },
    /// A node finished (successfully or with a captured failure).
    NodeFinished {
        execution_id: ExecutionId,
        node_id: String,
        success: bool,
        elapsed_ms: u64,
    },
    /// Run completed.
    RunCompleted {
        execution_id: ExecutionId,
        nodes_visited: usize,
    },
    /// Run failed with a fatal error.
    RunFailed {
        execution_id: ExecutionId,
        error: String,
    },
    /// Run canceled by the substrate.
    RunCanceled { execution_id: ExecutionId },
}
