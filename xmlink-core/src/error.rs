//! Domain-specific error types for the xmlink protocol engine.
//!
//! All fallible operations return `Result<T, LinkError>`.
//! Protocol-breaking failures (malformed fragments, a vanished peer) are
//! fatal to the stream; command-level failures are not errors at all and
//! surface as responses with `success != "true"`.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for xmlink.
#[derive(Debug, Error)]
pub enum LinkError {
    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The receive side ended while a blocking wait was outstanding.
    #[error("peer disconnected while waiting for {0}")]
    ConnectionLost(String),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Framing Errors ───────────────────────────────────────────
    /// A delimited fragment could not be parsed as a message.
    #[error("malformed message fragment ({reason}): {fragment:?}")]
    Malformed { fragment: String, reason: String },

    /// A delimited fragment was not valid UTF-8.
    #[error("invalid utf-8 in message fragment: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    // ── Configuration Errors ─────────────────────────────────────
    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl LinkError {
    /// Build a [`LinkError::Malformed`] from a fragment and any displayable
    /// parser error.
    pub fn malformed(fragment: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        LinkError::Malformed {
            fragment: fragment.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` when this error means the connection can no longer
    /// deliver messages.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LinkError::Timeout(_) | LinkError::Config(_))
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for LinkError {
    fn from(s: String) -> Self {
        LinkError::Other(s)
    }
}

impl From<&str> for LinkError {
    fn from(s: &str) -> Self {
        LinkError::Other(s.to_string())
    }
}
