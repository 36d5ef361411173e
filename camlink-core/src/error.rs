//! Domain-specific error types for camlink.
//!
//! All fallible operations return `Result<T, CamlinkError>`.
//! Construction-time failures of independent modules and factories are
//! caught and logged by the context; everything past construction is
//! surfaced to the direct caller.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = CamlinkError> = std::result::Result<T, E>;

/// The canonical error type for camlink.
#[derive(Debug, Clone, Error)]
pub enum CamlinkError {
    // ── Configuration ────────────────────────────────────────────
    /// Settings were malformed or missing a required value.
    #[error("configuration error: {0}")]
    Config(String),

    // ── Registration ─────────────────────────────────────────────
    /// Two context modules were registered under the same name.
    #[error("duplicate module '{0}' registered")]
    DuplicateModule(String),

    /// A context module was constructed with an empty name.
    #[error("empty context module name")]
    EmptyModuleName,

    // ── Devices ──────────────────────────────────────────────────
    /// A user device with this address is already present and alive.
    #[error("device already in context: {0}")]
    DuplicateDevice(String),

    /// The remote device is gone or the session was closed.
    #[error("session no longer valid: {0}")]
    SessionInvalid(String),

    /// A stream name did not match any stream of the device.
    #[error("unknown stream '{0}'")]
    UnknownStream(String),

    // ── Transport ────────────────────────────────────────────────
    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A lower-layer failure while creating or using a channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// An mpsc/watch channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Serialization ────────────────────────────────────────────
    /// Encoding or decoding of a message failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl CamlinkError {
    /// Returns `true` for errors that mean the caller must reopen the session.
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, CamlinkError::SessionInvalid(_))
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for CamlinkError {
    fn from(s: String) -> Self {
        CamlinkError::Other(s)
    }
}

impl From<&str> for CamlinkError {
    fn from(s: &str) -> Self {
        CamlinkError::Other(s.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for CamlinkError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        CamlinkError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for CamlinkError {
    fn from(e: serde_json::Error) -> Self {
        CamlinkError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = CamlinkError::DuplicateModule("bus".into());
        assert_eq!(e.to_string(), "duplicate module 'bus' registered");

        let e = CamlinkError::Timeout(Duration::from_secs(3));
        assert!(e.to_string().contains("3s"));
    }

    #[test]
    fn from_string() {
        let e: CamlinkError = "something broke".into();
        assert!(matches!(e, CamlinkError::Other(_)));
    }

    #[test]
    fn session_invalid_is_flagged() {
        assert!(CamlinkError::SessionInvalid("gone".into()).is_session_invalid());
        assert!(!CamlinkError::ChannelClosed.is_session_invalid());
    }

    #[test]
    fn from_json_is_config() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let e: CamlinkError = err.into();
        assert!(matches!(e, CamlinkError::Config(_)));
    }
}
