use std::io::Write;

use rpaflow_core::{
    ExecutionId, RunRequest, Workflow, WorkflowEdge, WorkflowId, WorkflowNode,
};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

/// `start -> nodes[0] -> .. -> nodes[n-1] -> end`.
pub fn linear_graph(middle: Vec<WorkflowNode>) -> (Vec<WorkflowNode>, Vec<WorkflowEdge>) {
    let mut nodes = vec![WorkflowNode::start("start")];
    nodes.extend(middle);
    nodes.push(WorkflowNode::end("end"));

    let edges = nodes
        .windows(2)
        .map(|pair| WorkflowEdge::new(&pair[0].id, &pair[1].id))
        .collect();
    (nodes, edges)
}

/// `start -> decide`, then one decision edge per entry of `conditions` to a
/// task `branch-<i>`, each of which leads to `end`. `None` is an
/// unconditioned (default) edge.
pub fn decision_graph(conditions: &[Option<&str>]) -> (Vec<WorkflowNode>, Vec<WorkflowEdge>) {
    let mut nodes = vec![WorkflowNode::start("start"), WorkflowNode::decision("decide")];
    let mut edges = vec![WorkflowEdge::new("start", "decide")];

    for (i, condition) in conditions.iter().enumerate() {
        let branch = format!("branch-{i}");
        nodes.push(WorkflowNode::task(&branch));
        edges.push(match condition {
            Some(c) => WorkflowEdge::conditional("decide", &branch, *c),
            None => WorkflowEdge::new("decide", &branch),
        });
        edges.push(WorkflowEdge::new(&branch, "end"));
    }
    nodes.push(WorkflowNode::end("end"));
    (nodes, edges)
}

pub fn run_request(
    nodes: Vec<WorkflowNode>,
    edges: Vec<WorkflowEdge>,
    input: Option<Value>,
) -> RunRequest {
    RunRequest {
        workflow_id: WorkflowId::from_string("wf-test"),
        execution_id: ExecutionId::new(),
        nodes,
        edges,
        input: input.and_then(|v| v.as_object().cloned()),
    }
}

/// Turn a `json!({..})` literal into a map.
pub fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Serialize a workflow into a temporary `.json` file.
pub fn workflow_file(workflow: &Workflow) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .unwrap();
    serde_json::to_writer_pretty(&mut file, workflow).unwrap();
    file.flush().unwrap();
    file
}

/// Write TOML config text to a temporary file.
pub fn config_file(toml_text: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(toml_text.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}
