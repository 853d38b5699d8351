use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpaError {
    // Graph structure errors
    #[error("Workflow has no start node")]
    NoStartNode,

    #[error("Node '{0}' has no outgoing edge")]
    NoOutgoingEdge(String),

    #[error("Edge from '{source_id}' targets unknown node '{target}'")]
    UnresolvedTarget { source_id: String, target: String },

    #[error("Decision node '{0}' has no matching condition and no default edge")]
    UnmatchedDecision(String),

    #[error("Unsupported node type on node '{0}'")]
    UnsupportedNodeType(String),

    #[error("Cycle detected: node '{0}' would be visited twice")]
    CycleDetected(String),

    // Script errors
    #[error("Script sandbox violation on node '{node}': {message}")]
    ScriptSandbox { node: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Substrate errors
    #[error("Orchestration error: {0}")]
    Orchestration(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpaError {
    /// Whether this error is one of the structural graph failures.
    pub fn is_graph_structure(&self) -> bool {
        matches!(
            self,
            RpaError::NoStartNode
                | RpaError::NoOutgoingEdge(_)
                | RpaError::UnresolvedTarget { .. }
                | RpaError::CycleDetected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RpaError>;
