pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, RpaError};
pub use event::EventBus;
pub use graph::*;
pub use types::*;
