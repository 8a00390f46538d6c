//! Error types for timberwire.

use thiserror::Error;

/// Main error type for all timberwire operations.
#[derive(Debug, Error)]
pub enum TimberwireError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (unexpected version byte, unknown frame type,
    /// malformed length, truncated compressed payload).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Read deadline exceeded while inside a window body.
    #[error("read timed out inside window")]
    Timeout,

    /// The injected event decoder rejected a payload (or panicked).
    #[error("event decode failed: {0}")]
    Decode(Box<dyn std::error::Error + Send + Sync>),

    /// Neither protocol version was enabled when building a server.
    #[error("no protocol version enabled")]
    NoVersionEnabled,
}

/// Result type alias using TimberwireError.
pub type Result<T> = std::result::Result<T, TimberwireError>;
