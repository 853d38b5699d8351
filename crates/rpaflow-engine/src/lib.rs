//! Workflow execution for rpaflow.
//!
//! [`WorkflowInterpreter`] walks a graph node by node, [`NodeDispatcher`]
//! runs each node by type, [`select_edge`] picks decision branches, and
//! [`ExecutionStatusReporter`] talks to the orchestration substrate.
//! [`Engine`] wires these to the in-process [`LocalOrchestrator`].

pub mod condition;
pub mod dispatcher;
pub mod interpreter;
pub mod orchestrator;
pub mod reporter;
pub mod runtime;

pub use condition::select_edge;
pub use dispatcher::NodeDispatcher;
pub use interpreter::{node_context, WorkflowInterpreter, INPUT_KEY};
pub use orchestrator::LocalOrchestrator;
pub use reporter::ExecutionStatusReporter;
pub use runtime::Engine;
