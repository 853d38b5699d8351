//! The single shared browser session and the actions performed on it.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use futures::future::BoxFuture;
use rpaflow_core::config::BrowserConfig;
use rpaflow_core::{BrowserActionSpec, BrowserActionType, NodeExecutionResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{
    BrowserBackend, BrowserProcess, BrowsingContext, DisconnectSignal, LaunchedSession, PageDriver,
};
use crate::error::{BrowserError, Result};

/// Lifecycle of the shared session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Uninitialized,
    Ready,
    Disconnected,
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What the engine needs from a browser session owner.
pub trait SessionManager: Send + Sync + 'static {
    /// Run one browser action. Never fails: errors come back as
    /// `{success: false, error}`.
    fn perform_action<'a>(&'a self, spec: &'a BrowserActionSpec) -> BoxFuture<'a, NodeExecutionResult>;

    /// Best-effort teardown of the session.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

struct Handles {
    process: Box<dyn BrowserProcess>,
    context: Box<dyn BrowsingContext>,
    page: Box<dyn PageDriver>,
}

impl Handles {
    fn is_usable(&self) -> bool {
        self.process.is_connected() && !self.page.is_closed()
    }
}

struct SessionState {
    status: SessionStatus,
    /// Incremented on every launch; identifies the live session.
    generation: u64,
    handles: Option<Handles>,
}

impl SessionState {
    fn is_ready(&self) -> bool {
        self.status == SessionStatus::Ready
            && self.handles.as_ref().is_some_and(Handles::is_usable)
    }
}

/// Owns the browser process/context/page triple shared by all browser actions
/// in this process.
///
/// Every public operation holds the state mutex for its whole duration, so at
/// most one action touches the page at a time.
pub struct BrowserSessionManager {
    backend: Arc<dyn BrowserBackend>,
    config: BrowserConfig,
    state: Arc<Mutex<SessionState>>,
}

impl BrowserSessionManager {
    pub fn new(backend: Arc<dyn BrowserBackend>, config: BrowserConfig) -> Self {
        Self {
            backend,
            config,
            state: Arc::new(Mutex::new(SessionState {
                status: SessionStatus::Uninitialized,
                generation: 0,
                handles: None,
            })),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status
    }

    /// Make sure a usable session exists and return its generation number.
    /// Distinct generations mean distinct underlying sessions.
    pub async fn acquire(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.acquire_locked(&mut state).await
    }

    /// Run one browser action; failures are returned as data.
    pub async fn perform_action(&self, spec: &BrowserActionSpec) -> NodeExecutionResult {
        let action = spec.action_type;
        if let Err(e) = validate(spec) {
            warn!(action = %action, error = %e, "Invalid browser action");
            return NodeExecutionResult::failure(e.to_string());
        }

        let mut state = self.state.lock().await;
        let max_retries = self.config.max_action_retries;
        let mut attempt = 0;
        loop {
            match self.attempt(&mut state, spec).await {
                Ok(result) => return result,
                Err(e) if e.is_connection_loss() && attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        action = %action,
                        attempt,
                        max_retries,
                        error = %e,
                        "Browser connection lost, relaunching session"
                    );
                    state.status = SessionStatus::Disconnected;
                }
                Err(e) => {
                    if e.is_connection_loss() {
                        state.status = SessionStatus::Disconnected;
                    }
                    warn!(action = %action, error = %e, "Browser action failed");
                    return NodeExecutionResult::failure(e.to_string());
                }
            }
        }
    }

    /// Close page, context and process (each best-effort) and mark the
    /// session Closed. A later action relaunches.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(handles) = state.handles.take() {
            teardown(handles).await;
        }
        state.status = SessionStatus::Closed;
        info!("Browser session closed");
    }

    async fn attempt(
        &self,
        state: &mut SessionState,
        spec: &BrowserActionSpec,
    ) -> Result<NodeExecutionResult> {
        self.acquire_locked(state).await?;

        // Re-check liveness right before use.
        let Some(handles) = state.handles.as_ref().filter(|h| h.is_usable()) else {
            return Err(BrowserError::TargetClosed(
                "session became unusable before the action ran".into(),
            ));
        };

        debug!(action = %spec.action_type, generation = state.generation, "Performing browser action");
        execute(handles.page.as_ref(), spec, &self.config).await
    }

    async fn acquire_locked(&self, state: &mut SessionState) -> Result<u64> {
        if state.is_ready() {
            return Ok(state.generation);
        }

        let mut last_err = BrowserError::Unusable;
        for attempt in 0..2 {
            if let Some(stale) = state.handles.take() {
                debug!(generation = state.generation, "Tearing down stale browser session");
                teardown(stale).await;
            }
            state.status = SessionStatus::Disconnected;

            match self.backend.launch(&self.config).await {
                Ok(launched) => {
                    let LaunchedSession {
                        process,
                        context,
                        page,
                        disconnected,
                    } = launched;
                    state.generation += 1;
                    state.handles = Some(Handles {
                        process,
                        context,
                        page,
                    });
                    self.watch_disconnect(state.generation, disconnected);

                    if state.handles.as_ref().is_some_and(Handles::is_usable) {
                        state.status = SessionStatus::Ready;
                        info!(generation = state.generation, "Browser session ready");
                        return Ok(state.generation);
                    }
                    warn!(attempt, "Launched browser session is not usable");
                    last_err = BrowserError::Unusable;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Browser launch failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Flip the session to Disconnected when this generation's process goes away.
    fn watch_disconnect(&self, generation: u64, signal: DisconnectSignal) {
        let state = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            // Err means the sender was dropped, which is also a disconnect.
            let _ = signal.await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.lock().await;
            if state.generation == generation && state.status == SessionStatus::Ready {
                warn!(generation, "Browser disconnected");
                state.status = SessionStatus::Disconnected;
            }
        });
    }
}

impl SessionManager for BrowserSessionManager {
    fn perform_action<'a>(&'a self, spec: &'a BrowserActionSpec) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(BrowserSessionManager::perform_action(self, spec))
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(BrowserSessionManager::shutdown(self))
    }
}

/// Close page, then context, then process; each failure is logged and ignored.
async fn teardown(mut handles: Handles) {
    if let Err(e) = handles.page.close().await {
        debug!(error = %e, "Error closing page");
    }
    if let Err(e) = handles.context.close().await {
        debug!(error = %e, "Error closing browser context");
    }
    if let Err(e) = handles.process.close().await {
        debug!(error = %e, "Error closing browser process");
    }
}

/// Checks that need no browser. Failures here are never retried.
fn validate(spec: &BrowserActionSpec) -> Result<()> {
    use BrowserActionType::*;

    let needs_selector = matches!(spec.action_type, Click | Type | Select | WaitForSelector | ExtractData);
    if needs_selector && spec.selector.as_deref().map_or(true, str::is_empty) {
        return Err(BrowserError::Validation(format!(
            "{} action requires a selector",
            spec.action_type
        )));
    }
    if matches!(spec.action_type, Type | Select) && spec.text.as_deref().map_or(true, str::is_empty) {
        return Err(BrowserError::Validation(format!(
            "{} action requires non-empty text",
            spec.action_type
        )));
    }
    if spec.action_type == Navigate {
        let raw = spec.url.as_deref().unwrap_or_default();
        if raw.trim().is_empty() {
            return Err(BrowserError::Validation("navigate action requires a url".into()));
        }
        normalize_url(raw)?;
    }
    Ok(())
}

/// Prefix a bare host with `https://` and check the result parses.
pub fn normalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let candidate = if trimmed.contains("://")
        || trimmed.starts_with("about:")
        || trimmed.starts_with("data:")
    {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    url::Url::parse(&candidate).map_err(|e| BrowserError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    Ok(candidate)
}

async fn execute(
    page: &dyn PageDriver,
    spec: &BrowserActionSpec,
    config: &BrowserConfig,
) -> Result<NodeExecutionResult> {
    let timeout = Duration::from_millis(spec.timeout_ms());
    let selector = spec.selector.as_deref().unwrap_or_default();
    let text = spec.text.as_deref().unwrap_or_default();

    match spec.action_type {
        BrowserActionType::Navigate => {
            let url = normalize_url(spec.url.as_deref().unwrap_or_default())?;
            navigate(page, &url, timeout, config).await
        }
        BrowserActionType::Click => {
            page.wait_for_selector(selector, timeout).await?;
            page.click(selector).await?;
            Ok(NodeExecutionResult::success())
        }
        BrowserActionType::Type => {
            page.wait_for_selector(selector, timeout).await?;
            page.fill(selector, text).await?;
            Ok(NodeExecutionResult::success())
        }
        BrowserActionType::Select => {
            page.wait_for_selector(selector, timeout).await?;
            page.select_option(selector, text).await?;
            Ok(NodeExecutionResult::success())
        }
        BrowserActionType::WaitForSelector => {
            page.wait_for_selector(selector, timeout).await?;
            Ok(NodeExecutionResult::success())
        }
        BrowserActionType::WaitForNavigation => {
            page.wait_for_navigation(timeout).await?;
            let url = page.url().await?.unwrap_or_default();
            Ok(NodeExecutionResult::success().with("url", url))
        }
        BrowserActionType::Screenshot => {
            let png = page.screenshot(spec.option_flag("fullPage")).await?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(png);
            Ok(NodeExecutionResult::success().with("screenshot", encoded))
        }
        BrowserActionType::ExtractData => {
            page.wait_for_selector(selector, timeout).await?;
            let data = page.extract(selector, spec.option_flag("textOnly")).await?;
            Ok(NodeExecutionResult::success().with("data", data))
        }
    }
}

/// Navigate with an in-place retry on timeouts and closed targets. A missing
/// or non-2xx response is still a success, with a `warning`.
async fn navigate(
    page: &dyn PageDriver,
    url: &str,
    timeout: Duration,
    config: &BrowserConfig,
) -> Result<NodeExecutionResult> {
    let max_retries = config.max_navigation_retries;
    let mut attempt = 0;
    let status = loop {
        match page.goto(url, timeout).await {
            Ok(status) => break status,
            Err(e) if e.is_navigation_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(url, attempt, max_retries, error = %e, "Navigation failed, retrying");
                tokio::time::sleep(config.navigation_backoff()).await;
            }
            Err(e) => return Err(e),
        }
    };

    let title = page.title().await?.unwrap_or_default();
    let current_url = page.url().await?.unwrap_or_else(|| url.to_string());
    let mut result = NodeExecutionResult::success()
        .with("url", current_url)
        .with("title", title);

    match status {
        Some(code) if (200..300).contains(&code) => {
            result = result.with("status", code);
        }
        Some(code) => {
            warn!(url, status = code, "Navigation returned non-success status");
            result = result
                .with("status", code)
                .with("warning", format!("navigation returned HTTP {code}"));
        }
        None => {
            warn!(url, "Navigation returned no response");
            result = result.with("warning", "navigation returned no response");
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bare_host() {
        assert_eq!(normalize_url("example.com").unwrap(), "https://example.com");
        assert_eq!(
            normalize_url(" localhost:3000/login ").unwrap(),
            "https://localhost:3000/login"
        );
        assert_eq!(
            normalize_url("http://example.com/a").unwrap(),
            "http://example.com/a"
        );
        assert_eq!(normalize_url("about:blank").unwrap(), "about:blank");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(matches!(
            normalize_url("exa mple.com").unwrap_err(),
            BrowserError::InvalidUrl { .. }
        ));
    }

    #[test]
    fn test_validate_required_fields() {
        let click = BrowserActionSpec::new(BrowserActionType::Click);
        assert!(matches!(validate(&click), Err(BrowserError::Validation(_))));

        let typed = BrowserActionSpec::new(BrowserActionType::Type)
            .with_selector("#q")
            .with_text("");
        assert!(matches!(validate(&typed), Err(BrowserError::Validation(_))));

        let nav = BrowserActionSpec::new(BrowserActionType::Navigate);
        assert!(matches!(validate(&nav), Err(BrowserError::Validation(_))));

        assert!(validate(&BrowserActionSpec::new(BrowserActionType::Screenshot)).is_ok());
        assert!(validate(&BrowserActionSpec::navigate("example.com")).is_ok());
    }
}
