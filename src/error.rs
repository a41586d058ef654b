//! Error types for arcproxy
//!
//! The variants follow the failure classes a client can observe:
//! - Protocol: malformed command, wrong argument count, unknown command
//! - Capacity: queue full, per-user queue full, too many sessions, too many lines
//! - Routing: nothing could be routed (per-line routing failures are values, not errors)
//! - Transport: submit/poll/download failures against an upstream node
//! - State: request not ready, not found, access denied, volume not found
//!
//! Only `Io` on the client socket is fatal for a session; everything else is
//! reported inline as `ERROR <reason>`.

use thiserror::Error;

/// Main error type for arcproxy
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Protocol(String),

    #[error("{0}")]
    Capacity(String),

    #[error("{0}")]
    Routing(String),

    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    State(String),

    #[error("local store error: {0}")]
    Storage(String),

    #[error("timeout")]
    Timeout,
}

impl Error {
    /// Whether the error may be reported to the client and the session kept open
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Io(_))
    }

    pub(crate) fn syntax() -> Self {
        Error::Protocol("syntax error".into())
    }

    pub(crate) fn access_denied() -> Self {
        Error::State("request not found or access denied".into())
    }
}

/// Result type alias for arcproxy
pub type Result<T> = std::result::Result<T, Error>;
