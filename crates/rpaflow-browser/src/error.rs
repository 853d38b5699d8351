use thiserror::Error;

/// Message fragments that indicate the browser, context or page went away.
const CONNECTION_LOSS_SIGNATURES: &[&str] = &[
    "target closed",
    "browser has been closed",
    "session closed",
    "connection closed",
    "context closed",
    "page closed",
];

#[derive(Debug, Clone, Error)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Target closed: {0}")]
    TargetClosed(String),

    #[error("Browser connection lost: {0}")]
    ConnectionLost(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The action request itself is malformed (missing selector, empty text, ...).
    #[error("{0}")]
    Validation(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Browser session not usable after relaunch")]
    Unusable,

    #[error("Browser protocol error: {0}")]
    Protocol(String),
}

impl BrowserError {
    /// Classify a raw driver message: connection-loss signatures become
    /// `ConnectionLost`, anything else `Protocol`.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if has_connection_loss_signature(&message) {
            BrowserError::ConnectionLost(message)
        } else {
            BrowserError::Protocol(message)
        }
    }

    /// Whether the failure means the session is gone and must be relaunched.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            BrowserError::TargetClosed(_) | BrowserError::ConnectionLost(_) => true,
            BrowserError::Validation(_) | BrowserError::InvalidUrl { .. } => false,
            other => has_connection_loss_signature(&other.to_string()),
        }
    }

    /// Whether a NAVIGATE attempt that failed this way should be retried in place.
    pub fn is_navigation_retryable(&self) -> bool {
        matches!(self, BrowserError::Timeout(_)) || self.is_connection_loss()
    }
}

fn has_connection_loss_signature(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONNECTION_LOSS_SIGNATURES
        .iter()
        .any(|sig| lower.contains(sig))
}

pub type Result<T> = std::result::Result<T, BrowserError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_connection_loss() {
        assert!(BrowserError::TargetClosed("page".into()).is_connection_loss());
        assert!(BrowserError::ConnectionLost("ws".into()).is_connection_loss());
        assert!(!BrowserError::ElementNotFound("#x".into()).is_connection_loss());
    }

    #[test]
    fn test_message_sniffing() {
        for msg in [
            "Protocol error: Target closed.",
            "browser has been closed",
            "Session closed. Most likely the page has been closed.",
            "Connection closed unexpectedly",
        ] {
            assert!(
                BrowserError::from_message(msg).is_connection_loss(),
                "{msg}"
            );
        }
        assert!(!BrowserError::from_message("Cannot find context with specified id").is_connection_loss());
        assert!(BrowserError::Launch("Page closed during startup".into()).is_connection_loss());
    }

    #[test]
    fn test_validation_never_retried() {
        let err = BrowserError::Validation("page closed is not a selector".into());
        assert!(!err.is_connection_loss());
        assert!(!err.is_navigation_retryable());
        assert!(BrowserError::Timeout("goto".into()).is_navigation_retryable());
    }
}
