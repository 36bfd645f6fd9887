//! Event model shared by event sources and the routing engine.
//!
//! An [`Event`] is an ordered bag of string headers with an optional body.
//! The engine only ever reads it through [`AttributeSource`], whose lookups
//! are total: a missing or unreadable attribute is simply `None`.

use std::fmt::Write as _;

/// Header carrying the event type tag.
pub const EVENT_NAME_HEADER: &str = "Event-Name";

/// Event type of keep-alive events emitted by the switch.
pub const HEARTBEAT_EVENT: &str = "HEARTBEAT";

/// Event type of console log lines forwarded by the switch.
pub const LOG_EVENT: &str = "LOG";

/// Headers probed, in order, for an identifier unique to one event.
pub const UNIQUE_ID_HEADERS: &[&str] = &["Event-UUID", "Unique-ID", "Event-Sequence"];

/// Read-only, non-failing attribute access.
///
/// Adapters around a concrete event binding implement this so that the
/// classifier never has to care how lookups fail underneath.
pub trait AttributeSource {
    /// Returns the value of the named attribute, or `None` if absent.
    fn get(&self, name: &str) -> Option<&str>;

    /// Returns the event body, or `None` if there is none.
    fn body(&self) -> Option<&str>;
}

/// A single event delivered by an event source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl Event {
    /// Creates an empty event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an event with the given `Event-Name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::new().with_header(EVENT_NAME_HEADER, name)
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_header(name, value);
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Appends a header in place.
    pub fn push_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Sets or clears the body in place.
    pub fn set_body(&mut self, body: Option<String>) {
        self.body = body;
    }

    /// Returns the event type tag, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.get(EVENT_NAME_HEADER).filter(|n| !n.is_empty())
    }

    /// Returns the headers in arrival order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns true for keep-alive events that carry no log content.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.name() == Some(HEARTBEAT_EVENT)
    }

    /// Returns the `(event-name, unique-id)` pair used for deduplication.
    ///
    /// Events lacking either part are never deduplicated.
    #[must_use]
    pub fn dedup_key(&self) -> Option<(String, String)> {
        let name = self.name()?;
        let id = UNIQUE_ID_HEADERS
            .iter()
            .find_map(|h| self.get(h).filter(|v| !v.is_empty()))?;
        Some((name.to_string(), id.to_string()))
    }

    /// Renders the event as a single log payload.
    ///
    /// `LOG` events render as their body. Any other named event renders as
    /// `[NAME] key=value ...` followed by ` | body` when a body is present.
    /// Returns `None` when there is nothing worth writing.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        let body = self.body().map(str::trim_end).filter(|b| !b.is_empty());

        match self.name() {
            Some(LOG_EVENT) => body.map(str::to_string),
            Some(name) => {
                let mut line = format!("[{name}]");
                for (key, value) in &self.headers {
                    let _ = write!(line, " {key}={}", single_line(value));
                }
                if let Some(body) = body {
                    let _ = write!(line, " | {}", single_line(body));
                }
                Some(line)
            }
            None => body.map(str::to_string),
        }
    }
}

impl AttributeSource for Event {
    fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }
}

/// Folds line breaks so one event never spans several log lines.
fn single_line(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains(['\n', '\r']) {
        std::borrow::Cow::Owned(value.replace("\r\n", " ").replace(['\n', '\r'], " "))
    } else {
        std::borrow::Cow::Borrowed(value)
    }
}
