//! Error types for bus operations.

use std::net::AddrParseError;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by publishers and subscribers.
///
/// Transport errors on an individual connection are absorbed by the session
/// that owns the socket (the connection is closed and removed); only
/// configuration and lifecycle errors reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid address '{address}': {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: AddrParseError,
    },

    #[error("Listener setup failed during {step}: {source}")]
    Listen {
        step: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Executor is not started")]
    ExecutorNotStarted,

    #[error("Publisher is not running")]
    NotRunning,

    #[error("Publisher is already running")]
    AlreadyRunning,
}
