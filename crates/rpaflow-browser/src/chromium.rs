//! Chrome DevTools Protocol backend built on chromiumoxide.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig as CdpConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::future::BoxFuture;
use futures::StreamExt;
use rpaflow_core::config::BrowserConfig;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use crate::backend::{BrowserBackend, BrowserProcess, BrowsingContext, LaunchedSession, PageDriver};
use crate::error::{BrowserError, Result};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROCESS_EXIT_GRACE: Duration = Duration::from_secs(5);

/// HTTP status of the current document, from the Navigation Timing API.
const NAVIGATION_STATUS_JS: &str =
    "(() => { const e = performance.getEntriesByType('navigation')[0]; \
     return e && e.responseStatus ? e.responseStatus : null; })()";

/// Launches a local Chrome/Chromium through the DevTools protocol.
#[derive(Debug, Default, Clone)]
pub struct ChromiumBackend;

impl ChromiumBackend {
    pub fn new() -> Self {
        Self
    }
}

impl BrowserBackend for ChromiumBackend {
    fn launch<'a>(&'a self, config: &'a BrowserConfig) -> BoxFuture<'a, Result<LaunchedSession>> {
        Box::pin(async move {
            let mut builder = CdpConfig::builder()
                .window_size(config.viewport_width, config.viewport_height)
                .viewport(Viewport {
                    width: config.viewport_width,
                    height: config.viewport_height,
                    ..Viewport::default()
                })
                .request_timeout(config.default_timeout())
                .args(config.launch_args.clone());
            if !config.headless {
                builder = builder.with_head();
            }
            if let Some(ref exe) = config.executable {
                builder = builder.chrome_executable(exe);
            }
            let cdp_config = builder.build().map_err(BrowserError::Launch)?;

            let (mut browser, mut handler) = Browser::launch(cdp_config)
                .await
                .map_err(|e| BrowserError::Launch(e.to_string()))?;

            // The handler must be polled for the connection to make progress;
            // its stream ends when the websocket closes.
            let connected = Arc::new(AtomicBool::new(true));
            let (disconnect_tx, disconnected) = oneshot::channel();
            let flag = connected.clone();
            tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        debug!(error = %e, "CDP handler error");
                    }
                }
                flag.store(false, Ordering::SeqCst);
                let _ = disconnect_tx.send(());
            });

            let (context_id, page) = match open_page(&mut browser, config).await {
                Ok(opened) => opened,
                Err(e) => {
                    let _ = browser.close().await;
                    return Err(e);
                }
            };

            info!(
                headless = config.headless,
                width = config.viewport_width,
                height = config.viewport_height,
                "Chromium launched"
            );

            let browser = Arc::new(Mutex::new(browser));
            Ok(LaunchedSession {
                process: Box::new(ChromiumProcess {
                    browser: browser.clone(),
                    connected: connected.clone(),
                }),
                context: Box::new(ChromiumContext {
                    browser,
                    id: Some(context_id),
                }),
                page: Box::new(ChromiumPage {
                    page,
                    closed: AtomicBool::new(false),
                    connected,
                }),
                disconnected,
            })
        })
    }
}

async fn open_page(browser: &mut Browser, config: &BrowserConfig) -> Result<(BrowserContextId, Page)> {
    let context_id = browser
        .create_browser_context(CreateBrowserContextParams::default())
        .await
        .map_err(map_cdp)?;

    let mut target = CreateTargetParams::new("about:blank");
    target.browser_context_id = Some(context_id.clone());
    let page = browser.new_page(target).await.map_err(map_cdp)?;
    page.set_user_agent(config.user_agent.clone())
        .await
        .map_err(map_cdp)?;

    Ok((context_id, page))
}

fn map_cdp(err: CdpError) -> BrowserError {
    match err {
        CdpError::Timeout => BrowserError::Timeout("CDP request timed out".into()),
        CdpError::NotFound => BrowserError::ElementNotFound("no node matched".into()),
        other => BrowserError::from_message(other.to_string()),
    }
}

async fn bounded<T>(
    timeout: Duration,
    what: impl FnOnce() -> String,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut).await.map_err(|_| {
        BrowserError::Timeout(format!("{} exceeded {}ms", what(), timeout.as_millis()))
    })?
}

/// Render a string as a JavaScript string literal.
fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

struct ChromiumProcess {
    browser: Arc<Mutex<Browser>>,
    connected: Arc<AtomicBool>,
}

impl BrowserProcess for ChromiumProcess {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut browser = self.browser.lock().await;
            let closed = browser.close().await.map(|_| ()).map_err(map_cdp);
            let _ = tokio::time::timeout(PROCESS_EXIT_GRACE, browser.wait()).await;
            closed
        })
    }
}

struct ChromiumContext {
    browser: Arc<Mutex<Browser>>,
    id: Option<BrowserContextId>,
}

impl BrowsingContext for ChromiumContext {
    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(id) = self.id.take() else {
                return Ok(());
            };
            self.browser
                .lock()
                .await
                .dispose_browser_context(id)
                .await
                .map_err(map_cdp)
        })
    }
}

struct ChromiumPage {
    page: Page,
    closed: AtomicBool,
    connected: Arc<AtomicBool>,
}

impl ChromiumPage {
    async fn navigation_status(&self) -> Option<u16> {
        let result = self.page.evaluate(NAVIGATION_STATUS_JS).await.ok()?;
        result.into_value::<Option<u16>>().ok().flatten()
    }
}

impl PageDriver for ChromiumPage {
    fn goto<'a>(&'a self, url: &'a str, timeout: Duration) -> BoxFuture<'a, Result<Option<u16>>> {
        Box::pin(async move {
            bounded(timeout, || format!("navigation to {url}"), async {
                self.page.goto(url).await.map_err(map_cdp)?;
                Ok(())
            })
            .await?;
            Ok(self.navigation_status().await)
        })
    }

    fn wait_for_selector<'a>(
        &'a self,
        selector: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            bounded(timeout, || format!("waiting for selector '{selector}'"), async {
                loop {
                    match self.page.find_element(selector).await {
                        Ok(_) => return Ok(()),
                        Err(e) => {
                            let e = map_cdp(e);
                            if e.is_connection_loss() {
                                return Err(e);
                            }
                        }
                    }
                    tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
                }
            })
            .await
        })
    }

    fn click<'a>(&'a self, selector: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let element = self.page.find_element(selector).await.map_err(map_cdp)?;
            element.click().await.map_err(map_cdp)?;
            Ok(())
        })
    }

    fn fill<'a>(&'a self, selector: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let element = self.page.find_element(selector).await.map_err(map_cdp)?;
            element
                .call_js_fn("function() { this.value = ''; }", false)
                .await
                .map_err(map_cdp)?;
            element.click().await.map_err(map_cdp)?;
            element.type_str(text).await.map_err(map_cdp)?;
            Ok(())
        })
    }

    fn select_option<'a>(&'a self, selector: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let element = self.page.find_element(selector).await.map_err(map_cdp)?;
            let function = format!(
                "function() {{ \
                   this.value = {}; \
                   this.dispatchEvent(new Event('input', {{ bubbles: true }})); \
                   this.dispatchEvent(new Event('change', {{ bubbles: true }})); \
                 }}",
                js_string(value)
            );
            element.call_js_fn(function, false).await.map_err(map_cdp)?;
            Ok(())
        })
    }

    fn wait_for_navigation(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            bounded(timeout, || "waiting for navigation".to_string(), async {
                self.page.wait_for_navigation().await.map_err(map_cdp)?;
                Ok(())
            })
            .await
        })
    }

    fn url(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move { self.page.url().await.map_err(map_cdp) })
    }

    fn title(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move { self.page.get_title().await.map_err(map_cdp) })
    }

    fn screenshot(&self, full_page: bool) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            self.page
                .screenshot(ScreenshotParams::builder().full_page(full_page).build())
                .await
                .map_err(map_cdp)
        })
    }

    fn extract<'a>(
        &'a self,
        selector: &'a str,
        text_only: bool,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            let script = format!(
                "Array.from(document.querySelectorAll({selector})).map(el => {{ \
                   const text = (el.textContent || '').trim(); \
                   if ({text_only}) return text; \
                   const attributes = {{}}; \
                   for (const attr of el.attributes) attributes[attr.name] = attr.value; \
                   return {{ text, attributes }}; \
                 }})",
                selector = js_string(selector),
            );
            self.page
                .evaluate(script)
                .await
                .map_err(map_cdp)?
                .into_value::<Vec<Value>>()
                .map_err(|e| BrowserError::Protocol(e.to_string()))
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.page.clone().close().await.map_err(map_cdp)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_string_escapes() {
        assert_eq!(js_string(r#"a[name="q"]"#), r#""a[name=\"q\"]""#);
    }

    #[test]
    fn test_cdp_timeout_maps_to_timeout() {
        assert!(matches!(map_cdp(CdpError::Timeout), BrowserError::Timeout(_)));
        assert!(matches!(
            map_cdp(CdpError::NotFound),
            BrowserError::ElementNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let err = bounded(Duration::from_millis(10), || "sleep".to_string(), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_navigation_retryable());
        assert!(err.to_string().contains("sleep exceeded 10ms"));
    }
}
