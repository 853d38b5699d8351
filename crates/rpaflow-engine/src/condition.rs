//! Decision-edge selection.

use rpaflow_core::WorkflowEdge;
use rpaflow_expr::evaluate_condition;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Pick the outgoing edge of a decision node.
///
/// Edges are scanned in order. The first edge whose condition evaluates true
/// wins immediately. Unconditioned edges are default candidates, and a later
/// one replaces an earlier one. A condition that fails to parse or evaluate
/// counts as false.
pub fn select_edge<'a>(
    outgoing: &[&'a WorkflowEdge],
    context: &Map<String, Value>,
) -> Option<&'a WorkflowEdge> {
    let mut default = None;

    for edge in outgoing {
        let Some(expr) = edge.condition() else {
            default = Some(*edge);
            continue;
        };

        match evaluate_condition(expr, context) {
            Ok(true) => {
                debug!(edge_id = %edge.id, target = %edge.target, condition = expr, "Condition matched");
                return Some(*edge);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    edge_id = %edge.id,
                    condition = expr,
                    error = %e,
                    "Condition evaluation failed, treating as false"
                );
            }
        }
    }

    if let Some(edge) = default {
        debug!(edge_id = %edge.id, target = %edge.target, "Taking default edge");
    }
    default
}
