//! Error types for the routing engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the partitioned log sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Neither the primary nor the fallback output directory is writable.
    #[error(
        "no writable log directory: primary {} failed ({reason}), fallback {}",
        .primary.display(),
        display_fallback(.fallback)
    )]
    NoWritableDirectory {
        /// Directory that was tried first.
        primary: PathBuf,
        /// Fallback directory, if one was configured.
        fallback: Option<PathBuf>,
        /// Last failure observed.
        reason: String,
    },

    /// Sink configuration is invalid.
    #[error("invalid sink configuration: {0}")]
    InvalidConfig(String),

    /// The sink has been closed and accepts no more writes.
    #[error("log sink is closed")]
    Closed,
}

fn display_fallback(fallback: &Option<PathBuf>) -> String {
    fallback
        .as_ref()
        .map_or_else(|| "<none>".to_string(), |p| p.display().to_string())
}

/// Errors raised by an event source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The upstream could not be reached.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The upstream rejected our credentials or subscription.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An operation needed a live connection and there was none.
    #[error("event source is not connected")]
    NotConnected,

    /// Socket-level failure on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The upstream sent something we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl SourceError {
    /// Returns true if the connection may still be usable after this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

/// Result type alias for sink operations.
pub type Result<T> = std::result::Result<T, SinkError>;
