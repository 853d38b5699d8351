//! The seam between the session manager and a concrete browser driver.

use std::time::Duration;

use futures::future::BoxFuture;
use rpaflow_core::config::BrowserConfig;
use tokio::sync::oneshot;

use crate::error::Result;

/// Fires once when the underlying browser process terminates or its
/// connection drops. A dropped sender counts as a disconnect too.
pub type DisconnectSignal = oneshot::Receiver<()>;

/// Launches browser sessions.
pub trait BrowserBackend: Send + Sync + 'static {
    /// Start a browser process with one browsing context and one page.
    fn launch<'a>(&'a self, config: &'a BrowserConfig) -> BoxFuture<'a, Result<LaunchedSession>>;
}

/// A freshly launched process/context/page triple.
pub struct LaunchedSession {
    pub process: Box<dyn BrowserProcess>,
    pub context: Box<dyn BrowsingContext>,
    pub page: Box<dyn PageDriver>,
    pub disconnected: DisconnectSignal,
}

pub trait BrowserProcess: Send + Sync {
    fn is_connected(&self) -> bool;

    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

pub trait BrowsingContext: Send + Sync {
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Page-level operations used by browser actions.
pub trait PageDriver: Send + Sync {
    /// Navigate and return the main document's HTTP status, when known.
    fn goto<'a>(&'a self, url: &'a str, timeout: Duration) -> BoxFuture<'a, Result<Option<u16>>>;

    /// Wait until at least one element matches `selector`.
    fn wait_for_selector<'a>(
        &'a self,
        selector: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<()>>;

    fn click<'a>(&'a self, selector: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Replace the value of an input with `text`.
    fn fill<'a>(&'a self, selector: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>>;

    fn select_option<'a>(&'a self, selector: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>>;

    fn wait_for_navigation(&self, timeout: Duration) -> BoxFuture<'_, Result<()>>;

    fn url(&self) -> BoxFuture<'_, Result<Option<String>>>;

    fn title(&self) -> BoxFuture<'_, Result<Option<String>>>;

    /// PNG bytes of the viewport, or of the whole page when `full_page`.
    fn screenshot(&self, full_page: bool) -> BoxFuture<'_, Result<Vec<u8>>>;

    /// One entry per matching element: its trimmed text when `text_only`,
    /// otherwise `{text, attributes}`.
    fn extract<'a>(
        &'a self,
        selector: &'a str,
        text_only: bool,
    ) -> BoxFuture<'a, Result<Vec<serde_json::Value>>>;

    fn is_closed(&self) -> bool;

    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}
