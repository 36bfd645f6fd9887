//! Event source abstraction.
//!
//! The ingestion loop drives any [`EventSource`]; the ESL client is one
//! implementation and tests script their own.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::SourceError;
use crate::event::Event;

/// Default upstream host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default upstream port.
pub const DEFAULT_PORT: u16 = 8021;

/// Default upstream password.
pub const DEFAULT_PASSWORD: &str = "ClueCon";

/// Result type alias for event source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Boxed future returned by [`EventSource`] methods.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = SourceResult<T>> + Send + 'a>>;

/// Where and how to reach the upstream.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Shared secret sent on authentication.
    pub password: String,
}

impl Endpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
        }
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT, DEFAULT_PASSWORD)
    }
}

// Keep the password out of logs.
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A persistent, subscribable stream of events.
pub trait EventSource: Send {
    /// Open and authenticate a connection.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Connect`] or [`SourceError::Auth`] on failure.
    fn connect<'a>(&'a mut self, endpoint: &'a Endpoint) -> SourceFuture<'a, ()>;

    /// Returns true while the connection is usable.
    fn is_connected(&self) -> bool;

    /// Subscribe to events of `class` matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream refuses the subscription.
    fn subscribe<'a>(&'a mut self, class: &'a str, filter: &'a str) -> SourceFuture<'a, ()>;

    /// Wait up to `timeout` for the next event.
    ///
    /// `Ok(None)` means nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Transient errors ([`SourceError::is_transient`]) leave the connection
    /// usable; any other error means it is lost.
    fn recv_timeout(&mut self, timeout: Duration) -> SourceFuture<'_, Option<Event>>;

    /// Close the connection. Safe to call when already disconnected.
    fn disconnect(&mut self) -> SourceFuture<'_, ()>;
}
