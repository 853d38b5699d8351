//! Per-node-type execution.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use rpaflow_browser::SessionManager;
use rpaflow_core::config::{HttpConfig, ScriptConfig};
use rpaflow_core::{
    ApiCallSpec, NodeExecutionResult, NodeKind, Result, RpaError, ScriptSpec, WorkflowNode,
    DEFAULT_DELAY_MS,
};
use rpaflow_expr::{bindings_from_context, ScriptEngine, ScriptLimits};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Maps a node to the handler for its type.
///
/// Handler failures come back as `{success: false, error}` results. Only an
/// unsupported node type or a script sandbox violation is an `Err`, and
/// either one aborts the run.
pub struct NodeDispatcher {
    sessions: Arc<dyn SessionManager>,
    http: reqwest::Client,
    scripts: ScriptEngine,
}

impl NodeDispatcher {
    pub fn new(
        sessions: Arc<dyn SessionManager>,
        http_config: &HttpConfig,
        script_config: &ScriptConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(http_config.timeout_secs))
            .user_agent(http_config.user_agent.clone())
            .build()
            .map_err(|e| RpaError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            sessions,
            http,
            scripts: ScriptEngine::new(ScriptLimits {
                max_steps: script_config.max_steps,
                max_depth: script_config.max_depth,
            }),
        })
    }

    /// The browser session manager used for BROWSER_ACTION nodes.
    pub fn sessions(&self) -> &Arc<dyn SessionManager> {
        &self.sessions
    }

    pub async fn execute(
        &self,
        node: &WorkflowNode,
        context: &Map<String, Value>,
    ) -> Result<NodeExecutionResult> {
        match &node.kind {
            NodeKind::Start => Ok(NodeExecutionResult::success().with("message", "Workflow started")),
            NodeKind::End => Ok(NodeExecutionResult::success().with("message", "Workflow finished")),
            NodeKind::Task => Ok(NodeExecutionResult::success()),
            NodeKind::Decision => Ok(NodeExecutionResult::success().with("nodeId", node.id.clone())),
            NodeKind::BrowserAction(spec) => Ok(self.sessions.perform_action(spec).await),
            NodeKind::Delay { milliseconds } => {
                let ms = milliseconds.unwrap_or(DEFAULT_DELAY_MS);
                delay(ms).await;
                Ok(NodeExecutionResult::success().with("delayedMs", ms))
            }
            NodeKind::ApiCall(spec) => Ok(self.api_call(&node.id, spec).await),
            NodeKind::Script(spec) => self.script(&node.id, spec, context),
            NodeKind::Unsupported => Err(RpaError::UnsupportedNodeType(node.id.clone())),
        }
    }

    async fn api_call(&self, node_id: &str, spec: &ApiCallSpec) -> NodeExecutionResult {
        match self.send(spec).await {
            Ok((status, data)) => {
                debug!(node_id, url = %spec.url, status, "API call finished");
                NodeExecutionResult::success()
                    .with("status", status)
                    .with("data", data)
            }
            Err(e) => {
                warn!(node_id, url = %spec.url, error = %e, "API call failed");
                NodeExecutionResult::failure(e)
            }
        }
    }

    /// Issue the request and decode the JSON response. No retries.
    async fn send(&self, spec: &ApiCallSpec) -> std::result::Result<(u16, Value), String> {
        let method = spec
            .method
            .to_uppercase()
            .parse::<reqwest::Method>()
            .map_err(|e| format!("Invalid HTTP method '{}': {}", spec.method, e))?;

        let mut req = self.http.request(method, &spec.url);
        if !spec
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()))
        {
            req = req.header(CONTENT_TYPE, "application/json");
        }
        for (key, value) in &spec.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        if let Some(body) = spec.body.as_ref().filter(|b| !b.is_null()) {
            req = req.body(body.to_string());
        }

        let resp = req.send().await.map_err(|e| format!("Request failed: {e}"))?;
        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| format!("Failed to read response body: {e}"))?;

        if bytes.is_empty() {
            return Ok((status, Value::Null));
        }
        let data = serde_json::from_slice(&bytes)
            .map_err(|e| format!("Invalid JSON response (HTTP {status}): {e}"))?;
        Ok((status, data))
    }

    fn script(
        &self,
        node_id: &str,
        spec: &ScriptSpec,
        context: &Map<String, Value>,
    ) -> Result<NodeExecutionResult> {
        let mut bindings = bindings_from_context(context);
        if let Some(extra) = &spec.context {
            bindings.extend(extra.clone());
        }
        bindings.insert("nodeId".into(), Value::String(node_id.to_string()));

        match self.scripts.run(&spec.code, bindings) {
            Ok(result) => Ok(NodeExecutionResult::success().with("result", result)),
            Err(e) if e.is_sandbox_violation() => Err(RpaError::ScriptSandbox {
                node: node_id.to_string(),
                message: e.to_string(),
            }),
            Err(e) => {
                warn!(node_id, error = %e, "Script failed");
                Ok(NodeExecutionResult::failure(e.to_string()))
            }
        }
    }
}

/// Suspend the calling task only. A zero delay still yields once.
async fn delay(ms: u64) {
    if ms == 0 {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use rpaflow_core::{BrowserActionSpec, BrowserActionType};
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records requested actions and answers with a canned result.
    #[derive(Default)]
    struct StubSessions {
        actions: Mutex<Vec<BrowserActionType>>,
    }

    impl SessionManager for StubSessions {
        fn perform_action<'a>(
            &'a self,
            spec: &'a BrowserActionSpec,
        ) -> BoxFuture<'a, NodeExecutionResult> {
            self.actions.lock().unwrap().push(spec.action_type);
            Box::pin(async { NodeExecutionResult::success().with("title", "Stub") })
        }

        fn shutdown(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn dispatcher() -> (NodeDispatcher, Arc<StubSessions>) {
        let sessions = Arc::new(StubSessions::default());
        let dispatcher = NodeDispatcher::new(
            sessions.clone(),
            &HttpConfig::default(),
            &ScriptConfig::default(),
        )
        .unwrap();
        (dispatcher, sessions)
    }

    fn api_node(url: String, method: &str, body: Option<Value>) -> WorkflowNode {
        WorkflowNode::api_call(
            "call",
            ApiCallSpec {
                url,
                method: method.into(),
                headers: Default::default(),
                body,
            },
        )
    }

    #[tokio::test]
    async fn test_markers_succeed() {
        let (dispatcher, _) = dispatcher();
        for node in [
            WorkflowNode::start("s"),
            WorkflowNode::end("e"),
            WorkflowNode::task("t"),
            WorkflowNode::decision("d"),
        ] {
            let result = dispatcher.execute(&node, &Map::new()).await.unwrap();
            assert!(result.success, "{} should succeed", node.id);
        }
    }

    #[tokio::test]
    async fn test_browser_action_delegates() {
        let (dispatcher, sessions) = dispatcher();
        let node = WorkflowNode::browser("open", BrowserActionSpec::navigate("example.com"));
        let result = dispatcher.execute(&node, &Map::new()).await.unwrap();
        assert_eq!(result.get_str("title"), Some("Stub"));
        assert_eq!(
            *sessions.actions.lock().unwrap(),
            vec![BrowserActionType::Navigate]
        );
    }

    #[tokio::test]
    async fn test_unsupported_node_is_fatal() {
        let (dispatcher, _) = dispatcher();
        let node: WorkflowNode =
            serde_json::from_value(json!({"id": "odd", "type": "email"})).unwrap();
        let err = dispatcher.execute(&node, &Map::new()).await.unwrap_err();
        assert!(matches!(err, RpaError::UnsupportedNodeType(id) if id == "odd"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_defaults_to_one_second() {
        let (dispatcher, _) = dispatcher();
        let node = WorkflowNode::new("wait", NodeKind::Delay { milliseconds: None });
        let started = tokio::time::Instant::now();
        let result = dispatcher.execute(&node, &Map::new()).await.unwrap();
        assert_eq!(result.get("delayedMs"), Some(&json!(1000)));
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_api_call_returns_status_and_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({"sku": "A-1", "qty": 2})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 77})))
            .mount(&server)
            .await;

        let (dispatcher, _) = dispatcher();
        let node = api_node(
            format!("{}/orders", server.uri()),
            "post",
            Some(json!({"sku": "A-1", "qty": 2})),
        );
        let result = dispatcher.execute(&node, &Map::new()).await.unwrap();

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.get("status"), Some(&json!(201)));
        assert_eq!(result.get("data"), Some(&json!({"id": 77})));
    }

    #[tokio::test]
    async fn test_api_call_error_status_is_still_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "down"})))
            .expect(1)
            .mount(&server)
            .await;

        let (dispatcher, _) = dispatcher();
        let result = dispatcher
            .execute(&api_node(server.uri(), "GET", None), &Map::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.get("status"), Some(&json!(500)));
    }

    #[tokio::test]
    async fn test_api_call_custom_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer t0k"))
            .and(header("content-type", "text/plain"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let (dispatcher, _) = dispatcher();
        let mut node = api_node(server.uri(), "GET", None);
        if let NodeKind::ApiCall(spec) = &mut node.kind {
            spec.headers.insert("Authorization".into(), "Bearer t0k".into());
            spec.headers.insert("Content-Type".into(), "text/plain".into());
        }
        let result = dispatcher.execute(&node, &Map::new()).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.get("status"), Some(&json!(204)));
        assert_eq!(result.get("data"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_api_call_invalid_json_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let (dispatcher, _) = dispatcher();
        let result = dispatcher
            .execute(&api_node(server.uri(), "GET", None), &Map::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Invalid JSON response"));
    }

    #[tokio::test]
    async fn test_api_call_transport_error_is_failure() {
        let (dispatcher, _) = dispatcher();
        let result = dispatcher
            .execute(&api_node("http://127.0.0.1:1/".into(), "GET", None), &Map::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Request failed"));
    }

    #[tokio::test]
    async fn test_script_reads_context_and_node_id() {
        let (dispatcher, _) = dispatcher();
        let node = WorkflowNode::script(
            "sum",
            "let total = 0; for (const o of orders) { total = total + o.qty; } return nodeId + \":\" + total;",
        );
        let context = rpaflow_test_utils::object(json!({"orders": [{"qty": 2}, {"qty": 3}]}));
        let result = dispatcher.execute(&node, &context).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.get_str("result"), Some("sum:5"));
    }

    #[tokio::test]
    async fn test_script_own_context_overrides() {
        let (dispatcher, _) = dispatcher();
        let mut node = WorkflowNode::script("s", "return limit;");
        if let NodeKind::Script(spec) = &mut node.kind {
            spec.context = Some(rpaflow_test_utils::object(json!({"limit": 10})));
        }
        let context = rpaflow_test_utils::object(json!({"limit": 1}));
        let result = dispatcher.execute(&node, &context).await.unwrap();
        assert_eq!(result.get("result"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn test_script_throw_is_captured() {
        let (dispatcher, _) = dispatcher();
        let node = WorkflowNode::script("s", r#"throw "quota exceeded";"#);
        let result = dispatcher.execute(&node, &Map::new()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("quota exceeded"));

        let node = WorkflowNode::script("s", "return ;;(");
        let result = dispatcher.execute(&node, &Map::new()).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_script_step_budget_is_fatal() {
        let sessions = Arc::new(StubSessions::default());
        let dispatcher = NodeDispatcher::new(
            sessions,
            &HttpConfig::default(),
            &ScriptConfig {
                max_steps: 50,
                max_depth: 64,
            },
        )
        .unwrap();
        let node = WorkflowNode::script(
            "spin",
            "let n = 0; for (const x of [1,2,3,4,5,6,7,8,9,10]) { for (const y of [1,2,3,4,5,6,7,8,9,10]) { n = n + 1; } } return n;",
        );
        let err = dispatcher.execute(&node, &Map::new()).await.unwrap_err();
        assert!(matches!(err, RpaError::ScriptSandbox { ref node, .. } if node == "spin"));
    }
}
