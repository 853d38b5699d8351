use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use rpaflow_core::config::RevisitPolicy;
use rpaflow_core::{
    EventBus, ExecutionEvent, ExecutionId, ExecutionResults, ExecutionStatus, Result, RpaError,
    RunOutcome, RunRequest, WorkflowEdge, WorkflowNode,
};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::condition::select_edge;
use crate::dispatcher::NodeDispatcher;
use crate::reporter::ExecutionStatusReporter;

/// Context key under which the whole run input is exposed to nodes.
pub const INPUT_KEY: &str = "input";

/// How a traversal ended when it did not fail.
enum Walk {
    Completed { visited: usize },
    Canceled,
}

/// Walks a workflow graph from its start node to an end node.
///
/// Nodes run strictly one after another. Each run owns its own result map and
/// visited set, so one interpreter can serve many concurrent runs.
pub struct WorkflowInterpreter {
    dispatcher: Arc<NodeDispatcher>,
    reporter: Arc<ExecutionStatusReporter>,
    event_bus: Arc<EventBus>,
    revisit_policy: RevisitPolicy,
}

impl WorkflowInterpreter {
    pub fn new(
        dispatcher: Arc<NodeDispatcher>,
        reporter: Arc<ExecutionStatusReporter>,
        event_bus: Arc<EventBus>,
        revisit_policy: RevisitPolicy,
    ) -> Self {
        Self {
            dispatcher,
            reporter,
            event_bus,
            revisit_policy,
        }
    }

    /// Execute one run to its terminal state.
    ///
    /// Reports RUNNING on entry and exactly one of COMPLETED, FAILED or
    /// CANCELED on exit. `cancel` is checked before each node.
    pub async fn run(&self, request: RunRequest, cancel: CancellationToken) -> RunOutcome {
        let RunRequest {
            workflow_id,
            execution_id,
            nodes,
            edges,
            input,
        } = request;
        let input = input.unwrap_or_default();
        let started = Instant::now();

        info!(
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            nodes = nodes.len(),
            edges = edges.len(),
            "Workflow run started"
        );
        self.reporter.report_started(&execution_id).await;
        self.event_bus.publish(ExecutionEvent::RunStarted {
            execution_id: execution_id.clone(),
            workflow_id: workflow_id.clone(),
        });

        let mut results = ExecutionResults::new();
        let walked = self
            .walk(&execution_id, &nodes, &edges, &input, &mut results, &cancel)
            .await;
        let total_ms = started.elapsed().as_millis() as u64;

        let (status, error) = match walked {
            Ok(Walk::Completed { visited }) => {
                info!(execution_id = %execution_id, visited, total_ms, "Workflow run completed");
                self.reporter
                    .report_completed(&execution_id, &results)
                    .await;
                self.event_bus.publish(ExecutionEvent::RunCompleted {
                    execution_id: execution_id.clone(),
                    nodes_visited: visited,
                });
                (ExecutionStatus::Completed, None)
            }
            Ok(Walk::Canceled) => {
                info!(execution_id = %execution_id, total_ms, "Workflow run canceled");
                self.reporter.report_canceled(&execution_id, &results).await;
                self.event_bus.publish(ExecutionEvent::RunCanceled {
                    execution_id: execution_id.clone(),
                });
                (ExecutionStatus::Canceled, None)
            }
            Err(e) => {
                let message = e.to_string();
                error!(execution_id = %execution_id, error = %message, total_ms, "Workflow run failed");
                self.reporter
                    .report_failed(&execution_id, &message, &results)
                    .await;
                self.event_bus.publish(ExecutionEvent::RunFailed {
                    execution_id: execution_id.clone(),
                    error: message.clone(),
                });
                (ExecutionStatus::Failed, Some(message))
            }
        };

        RunOutcome {
            execution_id,
            workflow_id,
            status,
            results,
            error,
        }
    }

    async fn walk(
        &self,
        execution_id: &ExecutionId,
        nodes: &[WorkflowNode],
        edges: &[WorkflowEdge],
        input: &Map<String, Value>,
        results: &mut ExecutionResults,
        cancel: &CancellationToken,
    ) -> Result<Walk> {
        let mut current = find_start(nodes)?;

        let mut by_id: HashMap<&str, &WorkflowNode> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            by_id.entry(node.id.as_str()).or_insert(node);
        }
        let mut visited: HashSet<&str> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(Walk::Canceled);
            }

            if !visited.insert(current.id.as_str()) {
                match self.revisit_policy {
                    RevisitPolicy::Fail => return Err(RpaError::CycleDetected(current.id.clone())),
                    RevisitPolicy::Complete => {
                        warn!(
                            execution_id = %execution_id,
                            node_id = %current.id,
                            "Node already visited, stopping traversal"
                        );
                        return Ok(Walk::Completed {
                            visited: visited.len(),
                        });
                    }
                }
            }

            let node_type = current.kind.type_name();
            info!(
                execution_id = %execution_id,
                node_id = %current.id,
                node_name = %current.name,
                node_type,
                "Executing node"
            );
            self.event_bus.publish(ExecutionEvent::NodeStarted {
                execution_id: execution_id.clone(),
                node_id: current.id.clone(),
                node_type,
            });

            let node_start = Instant::now();
            let context = node_context(input, results);
            let result = self.dispatcher.execute(current, &context).await?;
            let elapsed_ms = node_start.elapsed().as_millis() as u64;

            if let Some(ref e) = result.error {
                warn!(execution_id = %execution_id, node_id = %current.id, error = %e, "Node reported failure");
            }
            debug!(
                execution_id = %execution_id,
                node_id = %current.id,
                success = result.success,
                elapsed_ms,
                "Node execution complete"
            );
            self.event_bus.publish(ExecutionEvent::NodeFinished {
                execution_id: execution_id.clone(),
                node_id: current.id.clone(),
                success: result.success,
                elapsed_ms,
            });
            results.insert(current.id.clone(), result);

            if current.is_end() {
                return Ok(Walk::Completed {
                    visited: visited.len(),
                });
            }

            let outgoing: Vec<&WorkflowEdge> =
                edges.iter().filter(|e| e.source == current.id).collect();

            let edge = if current.is_decision() {
                let context = node_context(input, results);
                select_edge(&outgoing, &context)
                    .ok_or_else(|| RpaError::UnmatchedDecision(current.id.clone()))?
            } else {
                if outgoing.len() > 1 {
                    debug!(
                        node_id = %current.id,
                        edges = outgoing.len(),
                        "Several outgoing edges on a non-decision node, taking the first"
                    );
                }
                outgoing
                    .first()
                    .copied()
                    .ok_or_else(|| RpaError::NoOutgoingEdge(current.id.clone()))?
            };

            current = by_id.get(edge.target.as_str()).copied().ok_or_else(|| {
                RpaError::UnresolvedTarget {
                    source_id: current.id.clone(),
                    target: edge.target.clone(),
                }
            })?;
        }
    }
}

/// First START node in node order. Later START nodes are ignored.
fn find_start(nodes: &[WorkflowNode]) -> Result<&WorkflowNode> {
    let mut starts = nodes.iter().filter(|n| n.is_start());
    let first = starts.next().ok_or(RpaError::NoStartNode)?;
    let ignored: Vec<&str> = starts.map(|n| n.id.as_str()).collect();
    if !ignored.is_empty() {
        warn!(start = %first.id, ignored = ?ignored, "Workflow has several start nodes, using the first");
    }
    Ok(first)
}

/// The context a node sees: input fields at top level, the whole input under
/// [`INPUT_KEY`], and every prior node result under its node id.
pub fn node_context(input: &Map<String, Value>, results: &ExecutionResults) -> Map<String, Value> {
    let mut context = input.clone();
    context.insert(INPUT_KEY.into(), Value::Object(input.clone()));
    for (node_id, result) in results {
        context.insert(node_id.clone(), result.to_value());
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpaflow_core::NodeExecutionResult;
    use serde_json::json;

    #[test]
    fn test_find_start_uses_first() {
        let nodes = vec![
            WorkflowNode::task("t"),
            WorkflowNode::start("s1"),
            WorkflowNode::start("s2"),
        ];
        assert_eq!(find_start(&nodes).unwrap().id, "s1");
        assert!(matches!(
            find_start(&[WorkflowNode::end("e")]),
            Err(RpaError::NoStartNode)
        ));
    }

    #[test]
    fn test_node_context_layers() {
        let input = rpaflow_test_utils::object(json!({"user": "alice", "login": "stale"}));
        let mut results = ExecutionResults::new();
        results.insert(
            "login".into(),
            NodeExecutionResult::success().with("title", "Home"),
        );

        let context = node_context(&input, &results);
        assert_eq!(context["user"], "alice");
        assert_eq!(context["input"], json!({"user": "alice", "login": "stale"}));
        // Node results shadow input fields of the same name.
        assert_eq!(context["login"], json!({"success": true, "title": "Home"}));
    }
}
