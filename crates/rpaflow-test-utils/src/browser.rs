//! Scripted in-memory browser backend.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rpaflow_browser::{
    BrowserBackend, BrowserError, BrowserProcess, BrowsingContext, LaunchedSession, PageDriver,
    Result,
};
use rpaflow_core::config::BrowserConfig;
use serde_json::Value;
use tokio::sync::oneshot;

/// Operations that can have failures injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Launch,
    Goto,
    WaitForSelector,
    Click,
    Fill,
    SelectOption,
    WaitForNavigation,
    Screenshot,
    Extract,
    ClosePage,
    CloseContext,
    CloseProcess,
}

struct Shared {
    failures: Mutex<HashMap<MockOp, VecDeque<BrowserError>>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    unusable_launches: AtomicUsize,
    navigation_status: Mutex<Option<u16>>,
    extract_data: Mutex<Vec<Value>>,
    op_delay: Mutex<Duration>,
}

impl Shared {
    fn take_failure(&self, op: MockOp) -> Option<BrowserError> {
        self.failures
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
    }
}

/// A [`BrowserBackend`] whose sessions live in memory and record every call.
///
/// Cloning shares state, so a test can keep a handle after giving the backend
/// to a session manager.
#[derive(Clone)]
pub struct MockBrowserBackend {
    shared: Arc<Shared>,
}

impl Default for MockBrowserBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrowserBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                failures: Mutex::new(HashMap::new()),
                sessions: Mutex::new(Vec::new()),
                unusable_launches: AtomicUsize::new(0),
                navigation_status: Mutex::new(Some(200)),
                extract_data: Mutex::new(Vec::new()),
                op_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Make the next call of `op` fail with `error`. Calls queue up.
    pub fn fail(&self, op: MockOp, error: BrowserError) -> &Self {
        self.shared
            .failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(error);
        self
    }

    /// The next `n` launches return a session whose process is already gone.
    pub fn launch_unusable(&self, n: usize) {
        self.shared.unusable_launches.store(n, Ordering::SeqCst);
    }

    /// HTTP status reported by `goto` (`None` = no response).
    pub fn set_navigation_status(&self, status: Option<u16>) {
        *self.shared.navigation_status.lock().unwrap() = status;
    }

    pub fn set_extract_data(&self, data: Vec<Value>) {
        *self.shared.extract_data.lock().unwrap() = data;
    }

    /// Make every page operation take `delay`.
    pub fn set_op_delay(&self, delay: Duration) {
        *self.shared.op_delay.lock().unwrap() = delay;
    }

    /// Number of launch attempts that produced a session.
    pub fn launches(&self) -> usize {
        self.shared.sessions.lock().unwrap().len()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.shared.sessions.lock().unwrap().clone()
    }

    pub fn session(&self, index: usize) -> Option<Arc<MockSession>> {
        self.shared.sessions.lock().unwrap().get(index).cloned()
    }

    pub fn latest_session(&self) -> Option<Arc<MockSession>> {
        self.shared.sessions.lock().unwrap().last().cloned()
    }
}

impl BrowserBackend for MockBrowserBackend {
    fn launch<'a>(&'a self, _config: &'a BrowserConfig) -> BoxFuture<'a, Result<LaunchedSession>> {
        Box::pin(async move {
            if let Some(e) = self.shared.take_failure(MockOp::Launch) {
                return Err(e);
            }

            let usable = self
                .shared
                .unusable_launches
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err();

            let (tx, rx) = oneshot::channel();
            let session = {
                let mut sessions = self.shared.sessions.lock().unwrap();
                let session = Arc::new(MockSession {
                    id: sessions.len(),
                    connected: AtomicBool::new(usable),
                    page_closed: AtomicBool::new(false),
                    disconnect_tx: Mutex::new(Some(tx)),
                    page_closes: AtomicUsize::new(0),
                    context_closes: AtomicUsize::new(0),
                    process_closes: AtomicUsize::new(0),
                    calls: Mutex::new(Vec::new()),
                });
                sessions.push(session.clone());
                session
            };

            Ok(LaunchedSession {
                process: Box::new(MockProcess {
                    session: session.clone(),
                    shared: self.shared.clone(),
                }),
                context: Box::new(MockContext {
                    session: session.clone(),
                    shared: self.shared.clone(),
                }),
                page: Box::new(MockPage {
                    session,
                    shared: self.shared.clone(),
                }),
                disconnected: rx,
            })
        })
    }
}

/// One launched mock session; shared between the test and the handles.
pub struct MockSession {
    /// Launch index, starting at 0.
    pub id: usize,
    connected: AtomicBool,
    page_closed: AtomicBool,
    disconnect_tx: Mutex<Option<oneshot::Sender<()>>>,
    page_closes: AtomicUsize,
    context_closes: AtomicUsize,
    process_closes: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl MockSession {
    /// Simulate the browser process dying.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.disconnect_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    /// Simulate the page being closed from outside.
    pub fn close_page_externally(&self) {
        self.page_closed.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn page_closes(&self) -> usize {
        self.page_closes.load(Ordering::SeqCst)
    }

    pub fn context_closes(&self) -> usize {
        self.context_closes.load(Ordering::SeqCst)
    }

    pub fn process_closes(&self) -> usize {
        self.process_closes.load(Ordering::SeqCst)
    }

    /// Page calls in order, e.g. `"goto https://example.com"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

struct MockProcess {
    session: Arc<MockSession>,
    shared: Arc<Shared>,
}

impl BrowserProcess for MockProcess {
    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.session.process_closes.fetch_add(1, Ordering::SeqCst);
            self.session.connected.store(false, Ordering::SeqCst);
            match self.shared.take_failure(MockOp::CloseProcess) {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }
}

struct MockContext {
    session: Arc<MockSession>,
    shared: Arc<Shared>,
}

impl BrowsingContext for MockContext {
    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.session.context_closes.fetch_add(1, Ordering::SeqCst);
            match self.shared.take_failure(MockOp::CloseContext) {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }
}

struct MockPage {
    session: Arc<MockSession>,
    shared: Arc<Shared>,
}

impl MockPage {
    /// Common prologue of every page operation: delay, injected failure,
    /// liveness, then record the call.
    async fn enter(&self, op: MockOp, call: String) -> Result<()> {
        let delay = *self.shared.op_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.shared.take_failure(op) {
            return Err(e);
        }
        if !self.session.is_connected() {
            return Err(BrowserError::TargetClosed("browser has been closed".into()));
        }
        if self.session.page_closed.load(Ordering::SeqCst) {
            return Err(BrowserError::TargetClosed("page closed".into()));
        }
        self.session.record(call);
        Ok(())
    }
}

impl PageDriver for MockPage {
    fn goto<'a>(&'a self, url: &'a str, _timeout: Duration) -> BoxFuture<'a, Result<Option<u16>>> {
        Box::pin(async move {
            self.enter(MockOp::Goto, format!("goto {url}")).await?;
            Ok(*self.shared.navigation_status.lock().unwrap())
        })
    }

    fn wait_for_selector<'a>(
        &'a self,
        selector: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.enter(MockOp::WaitForSelector, format!("wait {selector}")))
    }

    fn click<'a>(&'a self, selector: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.enter(MockOp::Click, format!("click {selector}")))
    }

    fn fill<'a>(&'a self, selector: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.enter(MockOp::Fill, format!("fill {selector} {text}")))
    }

    fn select_option<'a>(&'a self, selector: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.enter(MockOp::SelectOption, format!("select {selector} {value}")))
    }

    fn wait_for_navigation(&self, _timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.enter(MockOp::WaitForNavigation, "wait_for_navigation".into()))
    }

    fn url(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let last = self
                .session
                .calls()
                .into_iter()
                .rev()
                .find_map(|c| c.strip_prefix("goto ").map(str::to_string));
            Ok(Some(last.unwrap_or_else(|| "about:blank".into())))
        })
    }

    fn title(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move { Ok(Some("Mock Page".into())) })
    }

    fn screenshot(&self, full_page: bool) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            self.enter(MockOp::Screenshot, format!("screenshot full_page={full_page}"))
                .await?;
            Ok(b"\x89PNG mock".to_vec())
        })
    }

    fn extract<'a>(
        &'a self,
        selector: &'a str,
        text_only: bool,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            self.enter(MockOp::Extract, format!("extract {selector} text_only={text_only}"))
                .await?;
            Ok(self.shared.extract_data.lock().unwrap().clone())
        })
    }

    fn is_closed(&self) -> bool {
        self.session.page_closed.load(Ordering::SeqCst) || !self.session.is_connected()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.session.page_closes.fetch_add(1, Ordering::SeqCst);
            self.session.page_closed.store(true, Ordering::SeqCst);
            match self.shared.take_failure(MockOp::ClosePage) {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }
}
