//! Test doubles and graph fixtures shared by the rpaflow test suites.

pub mod browser;
pub mod fixtures;
pub mod sink;

pub use browser::{MockBrowserBackend, MockOp, MockSession};
pub use fixtures::*;
pub use sink::{FailingSink, RecordingSink};
