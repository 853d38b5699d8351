use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::WorkflowId;

/// Canvas position from the designer. Carried through, never interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A node in a workflow graph.
///
/// The node's type-specific fields live in `kind`, which is flattened so the
/// wire format is `{"id": .., "type": "browser_action", "actionType": .., ..}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Type-specific payload of a node, one variant per node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Task,
    /// Branching node. Its outgoing edges carry the conditions.
    Decision,
    BrowserAction(BrowserActionSpec),
    Delay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        milliseconds: Option<u64>,
    },
    ApiCall(ApiCallSpec),
    Script(ScriptSpec),
    /// Any `type` tag this engine does not know. Rejected at dispatch time.
    #[serde(other)]
    Unsupported,
}

impl NodeKind {
    /// Wire name of the node type.
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Task => "task",
            NodeKind::Decision => "decision",
            NodeKind::BrowserAction(_) => "browser_action",
            NodeKind::Delay { .. } => "delay",
            NodeKind::ApiCall(_) => "api_call",
            NodeKind::Script(_) => "script",
            NodeKind::Unsupported => "unsupported",
        }
    }
}

/// Default DELAY duration when a node omits `milliseconds`.
pub const DEFAULT_DELAY_MS: u64 = 1000;

/// Default browser action timeout.
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 30_000;

/// Browser operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BrowserActionType {
    Navigate,
    Click,
    Type,
    Select,
    WaitForSelector,
    WaitForNavigation,
    Screenshot,
    ExtractData,
}

impl std::fmt::Display for BrowserActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::Type => "type",
            Self::Select => "select",
            Self::WaitForSelector => "waitForSelector",
            Self::WaitForNavigation => "waitForNavigation",
            Self::Screenshot => "screenshot",
            Self::ExtractData => "extractData",
        };
        f.write_str(name)
    }
}

/// A browser action request, as carried by BROWSER_ACTION nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserActionSpec {
    pub action_type: BrowserActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Per-operation timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl BrowserActionSpec {
    pub fn new(action_type: BrowserActionType) -> Self {
        Self {
            action_type,
            url: None,
            selector: None,
            text: None,
            timeout: None,
            options: serde_json::Map::new(),
        }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self::new(BrowserActionType::Navigate).with_url(url)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_ACTION_TIMEOUT_MS)
    }

    /// Boolean option lookup; absent or non-boolean values are `false`.
    pub fn option_flag(&self, key: &str) -> bool {
        self.options
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Outbound HTTP request carried by API_CALL nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "GET".into()
}

/// Sandboxed script carried by SCRIPT nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub code: String,
    /// Extra bindings layered over the execution context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Map<String, serde_json::Value>>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            position: None,
            kind,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End)
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Task)
    }

    pub fn decision(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Decision)
    }

    pub fn delay(id: impl Into<String>, milliseconds: u64) -> Self {
        Self::new(
            id,
            NodeKind::Delay {
                milliseconds: Some(milliseconds),
            },
        )
    }

    pub fn browser(id: impl Into<String>, spec: BrowserActionSpec) -> Self {
        Self::new(id, NodeKind::BrowserAction(spec))
    }

    pub fn api_call(id: impl Into<String>, spec: ApiCallSpec) -> Self {
        Self::new(id, NodeKind::ApiCall(spec))
    }

    pub fn script(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Script(ScriptSpec {
                code: code.into(),
                context: None,
            }),
        )
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_start(&self) -> bool {
        matches!(self.kind, NodeKind::Start)
    }

    pub fn is_end(&self) -> bool {
        matches!(self.kind, NodeKind::End)
    }

    pub fn is_decision(&self) -> bool {
        matches!(self.kind, NodeKind::Decision)
    }
}

/// A directed transition between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    #[serde(default)]
    pub id: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Boolean expression guarding this edge (decision nodes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl WorkflowEdge {
    /// Create an unconditional edge.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            label: None,
            condition: None,
        }
    }

    /// Create a conditional edge.
    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        let mut edge = Self::new(source, target);
        edge.condition = Some(condition.into());
        edge
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// The guard expression, if any. Blank strings count as no condition.
    pub fn condition(&self) -> Option<&str> {
        self.condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> String {
    "1.0.0".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    Error,
    Warning,
}

/// A structural problem found by [`Workflow::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphIssue {
    pub severity: IssueSeverity,
    pub message: String,
}

impl GraphIssue {
    fn error(message: String) -> Self {
        Self {
            severity: IssueSeverity::Error,
            message,
        }
    }

    fn warning(message: String) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            message,
        }
    }
}

impl Workflow {
    pub fn new(name: impl Into<String>, nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            description: None,
            version: default_version(),
            nodes,
            edges,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the graph for structural problems.
    ///
    /// Errors make the workflow unrunnable; warnings flag graphs that run but
    /// probably do not do what the author meant.
    pub fn validate(&self) -> Vec<GraphIssue> {
        let mut issues = Vec::new();
        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();

        let starts = self.nodes.iter().filter(|n| n.is_start()).count();
        match starts {
            0 => issues.push(GraphIssue::error("workflow has no start node".into())),
            1 => {}
            n => issues.push(GraphIssue::warning(format!(
                "workflow has {} start nodes; the first one is used",
                n
            ))),
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !ids.contains(endpoint.as_str()) {
                    issues.push(GraphIssue::error(format!(
                        "edge '{}' references unknown node '{}'",
                        edge.id, endpoint
                    )));
                }
            }
        }

        for node in &self.nodes {
            if matches!(node.kind, NodeKind::Unsupported) {
                issues.push(GraphIssue::error(format!(
                    "node '{}' has an unsupported type",
                    node.id
                )));
            }

            let outgoing: Vec<&WorkflowEdge> =
                self.edges.iter().filter(|e| e.source == node.id).collect();

            if node.is_decision() {
                if !outgoing.iter().any(|e| e.condition().is_none()) {
                    issues.push(GraphIssue::warning(format!(
                        "decision node '{}' has no default (unconditioned) edge",
                        node.id
                    )));
                }
                continue;
            }

            if outgoing.iter().any(|e| e.condition().is_some()) {
                issues.push(GraphIssue::warning(format!(
                    "node '{}' is not a decision node; its edge conditions are ignored",
                    node.id
                )));
            }
            if outgoing.len() > 1 {
                issues.push(GraphIssue::warning(format!(
                    "node '{}' has {} outgoing edges; only the first is followed",
                    node.id,
                    outgoing.len()
                )));
            }
            if outgoing.is_empty() && !node.is_end() {
                issues.push(GraphIssue::warning(format!(
                    "node '{}' has no outgoing edge and is not an end node",
                    node.id
                )));
            }
        }

        issues
    }

    /// Whether `validate` found no errors (warnings are allowed).
    pub fn is_runnable(&self) -> bool {
        self.validate()
            .iter()
            .all(|i| i.severity != IssueSeverity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_wire_format() {
        let json = serde_json::json!({
            "id": "n1",
            "name": "Open site",
            "type": "browser_action",
            "position": {"x": 10.0, "y": 20.0},
            "actionType": "waitForSelector",
            "selector": "#login",
            "timeout": 5000
        });
        let node: WorkflowNode = serde_json::from_value(json).unwrap();
        assert_eq!(node.id, "n1");
        assert_eq!(node.position, Some(Position { x: 10.0, y: 20.0 }));
        match &node.kind {
            NodeKind::BrowserAction(spec) => {
                assert_eq!(spec.action_type, BrowserActionType::WaitForSelector);
                assert_eq!(spec.selector.as_deref(), Some("#login"));
                assert_eq!(spec.timeout_ms(), 5000);
            }
            other => panic!("expected browser action, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_node_type_is_unsupported() {
        let json = serde_json::json!({"id": "x", "type": "teleport"});
        let node: WorkflowNode = serde_json::from_value(json).unwrap();
        assert!(matches!(node.kind, NodeKind::Unsupported));
    }

    #[test]
    fn test_delay_and_api_defaults() {
        let delay: WorkflowNode =
            serde_json::from_value(serde_json::json!({"id": "d", "type": "delay"})).unwrap();
        assert!(matches!(delay.kind, NodeKind::Delay { milliseconds: None }));

        let api: WorkflowNode = serde_json::from_value(serde_json::json!({
            "id": "a", "type": "api_call", "url": "https://api.example.com"
        }))
        .unwrap();
        match api.kind {
            NodeKind::ApiCall(spec) => {
                assert_eq!(spec.method, "GET");
                assert!(spec.headers.is_empty());
            }
            other => panic!("expected api call, got {:?}", other),
        }
    }

    #[test]
    fn test_blank_condition_is_default_edge() {
        let mut edge = WorkflowEdge::conditional("a", "b", "   ");
        assert_eq!(edge.condition(), None);
        edge.condition = Some(" x > 1 ".into());
        assert_eq!(edge.condition(), Some("x > 1"));
    }

    #[test]
    fn test_validate_clean_graph() {
        let wf = Workflow::new(
            "ok",
            vec![WorkflowNode::start("s"), WorkflowNode::end("e")],
            vec![WorkflowEdge::new("s", "e")],
        );
        assert!(wf.validate().is_empty());
        assert!(wf.is_runnable());
    }

    #[test]
    fn test_validate_reports_problems() {
        let wf = Workflow::new(
            "broken",
            vec![
                WorkflowNode::task("t"),
                WorkflowNode::decision("d"),
                WorkflowNode::end("e"),
            ],
            vec![
                WorkflowEdge::conditional("t", "d", "x == 1"),
                WorkflowEdge::conditional("d", "e", "y"),
                WorkflowEdge::new("d", "ghost"),
            ],
        );
        let issues = wf.validate();
        assert!(!wf.is_runnable());
        assert!(issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Error && i.message.contains("no start")));
        assert!(issues.iter().any(|i| i.message.contains("ghost")));
        assert!(issues.iter().any(|i| i.message.contains("conditions are ignored")));
    }

    #[test]
    fn test_multiple_starts_is_warning() {
        let wf = Workflow::new(
            "two-starts",
            vec![
                WorkflowNode::start("s1"),
                WorkflowNode::start("s2"),
                WorkflowNode::end("e"),
            ],
            vec![WorkflowEdge::new("s1", "e"), WorkflowEdge::new("s2", "e")],
        );
        assert!(wf.is_runnable());
        assert!(wf
            .validate()
            .iter()
            .any(|i| i.severity == IssueSeverity::Warning && i.message.contains("2 start")));
    }
}
