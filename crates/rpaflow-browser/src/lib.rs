//! Browser automation for BROWSER_ACTION nodes.
//!
//! [`BrowserSessionManager`] owns one long-lived browser session per process
//! and relaunches it when the connection drops. The driver behind it is a
//! [`BrowserBackend`]; [`ChromiumBackend`] is the production implementation.

pub mod backend;
pub mod chromium;
pub mod error;
pub mod session;

pub use backend::{
    BrowserBackend, BrowserProcess, BrowsingContext, DisconnectSignal, LaunchedSession, PageDriver,
};
pub use chromium::ChromiumBackend;
pub use error::{BrowserError, Result};
pub use session::{normalize_url, BrowserSessionManager, SessionManager, SessionStatus};
