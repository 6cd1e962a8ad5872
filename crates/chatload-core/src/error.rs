use std::time::Duration;
use thiserror::Error;

/// Failure to establish or use a connection to the target.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid target url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("handshake with {url} failed: {reason}")]
    Handshake { url: String, reason: String },

    #[error("handshake with {url} timed out after {timeout:?}")]
    HandshakeTimeout { url: String, timeout: Duration },

    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Run-level failures. Per-message failures never surface here.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{phase} phase did not finish within {limit:?}")]
    PhaseTimeout { phase: String, limit: Duration },

    #[error("message generator failed: {0}")]
    Generator(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
