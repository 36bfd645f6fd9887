//! Inbound event socket client.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use percent_encoding::percent_decode_str;
use switchlog_core::error::SourceError;
use switchlog_core::event::{Event, LOG_EVENT};
use switchlog_core::source::{Endpoint, EventSource, SourceFuture, SourceResult};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::codec::{CONTENT_LENGTH, CONTENT_TYPE, EslCodec, EslError, EslFrame, parse_header_block};

/// Default bound on connecting and on each handshake reply.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Content types the switch sends.
pub mod content_type {
    /// Greeting asking for a password.
    pub const AUTH_REQUEST: &str = "auth/request";
    /// Reply to a command.
    pub const COMMAND_REPLY: &str = "command/reply";
    /// Reply to an `api` command.
    pub const API_RESPONSE: &str = "api/response";
    /// An event serialized as URL-encoded headers.
    pub const EVENT_PLAIN: &str = "text/event-plain";
    /// A console log line.
    pub const LOG_DATA: &str = "log/data";
    /// The switch is closing the socket.
    pub const DISCONNECT_NOTICE: &str = "text/disconnect-notice";
}

impl From<EslError> for SourceError {
    fn from(err: EslError) -> Self {
        match err {
            EslError::Io(e) => Self::Io(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// [`EventSource`] speaking the inbound event socket protocol over TCP.
#[derive(Debug)]
pub struct EslClient {
    framed: Option<Framed<TcpStream, EslCodec>>,
    connect_timeout: Duration,
}

impl Default for EslClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EslClient {
    /// Creates a disconnected client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            framed: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the bound on connecting and on each handshake reply.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn handshake(&mut self, endpoint: &Endpoint) -> SourceResult<()> {
        let addr = endpoint.address();
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SourceError::Timeout(format!("connecting to {addr}")))?
            .map_err(|e| SourceError::Connect(format!("{addr}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let mut framed = Framed::new(stream, EslCodec::new());

        let greeting = next_frame(&mut framed, self.connect_timeout).await?;
        if greeting.content_type() != Some(content_type::AUTH_REQUEST) {
            return Err(SourceError::Protocol(format!(
                "expected {}, got {:?}",
                content_type::AUTH_REQUEST,
                greeting.content_type()
            )));
        }

        framed.send(format!("auth {}", endpoint.password)).await?;
        let reply = next_reply(&mut framed, self.connect_timeout).await?;
        if !reply.is_ok_reply() {
            return Err(SourceError::Auth(
                reply.reply_text().unwrap_or("no reply text").to_string(),
            ));
        }

        debug!(addr = %addr, "authenticated");
        self.framed = Some(framed);
        Ok(())
    }

    fn handle_frame(&mut self, frame: EslFrame) -> SourceResult<Option<Event>> {
        match frame.content_type() {
            Some(content_type::EVENT_PLAIN) => {
                let body = frame.body().unwrap_or_default();
                parse_plain_event(body).map(Some).map_err(SourceError::from)
            }
            Some(content_type::LOG_DATA) => Ok(Some(log_event(frame))),
            Some(content_type::DISCONNECT_NOTICE) => {
                info!("upstream sent disconnect notice");
                self.framed = None;
                Ok(None)
            }
            Some(content_type::COMMAND_REPLY | content_type::API_RESPONSE) => {
                trace!(reply = ?frame.reply_text(), "unsolicited reply");
                Ok(None)
            }
            other => {
                debug!(content_type = ?other, "ignoring frame");
                Ok(None)
            }
        }
    }
}

impl EventSource for EslClient {
    fn connect<'a>(&'a mut self, endpoint: &'a Endpoint) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            self.framed = None;
            self.handshake(endpoint).await
        })
    }

    fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    fn subscribe<'a>(&'a mut self, class: &'a str, filter: &'a str) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            let reply_timeout = self.connect_timeout;
            let framed = self.framed.as_mut().ok_or(SourceError::NotConnected)?;

            framed.send(format!("event {class} {filter}")).await?;
            let reply = next_reply(framed, reply_timeout).await?;
            if !reply.is_ok_reply() {
                return Err(SourceError::Auth(format!(
                    "subscription refused: {}",
                    reply.reply_text().unwrap_or("no reply text")
                )));
            }
            debug!(class, filter, "subscribed");
            Ok(())
        })
    }

    fn recv_timeout(&mut self, wait: Duration) -> SourceFuture<'_, Option<Event>> {
        Box::pin(async move {
            let framed = self.framed.as_mut().ok_or(SourceError::NotConnected)?;

            let frame = match timeout(wait, framed.next()).await {
                Err(_) => return Ok(None),
                Ok(None) => {
                    self.framed = None;
                    return Err(SourceError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )));
                }
                Ok(Some(Err(e))) => {
                    // The framed stream is unusable after a decode error.
                    self.framed = None;
                    return Err(e.into());
                }
                Ok(Some(Ok(frame))) => frame,
            };

            self.handle_frame(frame)
        })
    }

    fn disconnect(&mut self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            let Some(mut framed) = self.framed.take() else {
                return Ok(());
            };
            if let Err(e) = framed.send("exit".to_string()).await {
                debug!(error = %e, "failed to send exit");
            }
            if let Err(e) = framed.close().await {
                warn!(error = %e, "error closing connection");
            }
            debug!("disconnected");
            Ok(())
        })
    }
}

async fn next_frame(
    framed: &mut Framed<TcpStream, EslCodec>,
    wait: Duration,
) -> SourceResult<EslFrame> {
    match timeout(wait, framed.next()).await {
        Err(_) => Err(SourceError::Timeout("waiting for upstream".to_string())),
        Ok(None) => Err(SourceError::Connect(
            "connection closed during handshake".to_string(),
        )),
        Ok(Some(frame)) => frame.map_err(SourceError::from),
    }
}

/// Reads frames until a command reply arrives.
async fn next_reply(
    framed: &mut Framed<TcpStream, EslCodec>,
    wait: Duration,
) -> SourceResult<EslFrame> {
    loop {
        let frame = next_frame(framed, wait).await?;
        match frame.content_type() {
            Some(content_type::COMMAND_REPLY) => return Ok(frame),
            Some(content_type::DISCONNECT_NOTICE) => {
                return Err(SourceError::Connect(
                    "upstream closed the connection".to_string(),
                ));
            }
            other => trace!(content_type = ?other, "skipping frame while awaiting reply"),
        }
    }
}

/// Decodes the body of a `text/event-plain` frame.
///
/// The body is itself a header block with URL-encoded values, optionally
/// followed by `Content-Length` bytes of event body.
pub fn parse_plain_event(body: &str) -> Result<Event, EslError> {
    let (block, rest) = match body.find("\n\n") {
        Some(pos) => (&body[..pos], Some(&body[pos + 2..])),
        None => (body, None),
    };

    let headers = parse_header_block(block)?;
    if headers.is_empty() {
        return Err(EslError::InvalidHeader("empty event".to_string()));
    }

    let mut event = Event::new();
    let mut body_len = None;
    for (name, value) in headers {
        let value = percent_decode_str(&value).decode_utf8_lossy().into_owned();
        if name == CONTENT_LENGTH {
            body_len = Some(
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| EslError::InvalidContentLength(value.clone()))?,
            );
        }
        event.push_header(name, value);
    }

    if let (Some(len), Some(rest)) = (body_len, rest) {
        let end = floor_char_boundary(rest, len.min(rest.len()));
        event.set_body(Some(rest[..end].to_string()));
    }
    Ok(event)
}

/// Builds a `LOG` event from a `log/data` frame.
fn log_event(frame: EslFrame) -> Event {
    let mut event = Event::named(LOG_EVENT);
    for (name, value) in frame.headers() {
        if name != CONTENT_TYPE && name != CONTENT_LENGTH {
            event.push_header(name.clone(), value.clone());
        }
    }
    event.set_body(frame.into_body());
    event
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchlog_core::event::AttributeSource;

    #[test]
    fn parses_plain_event_headers() {
        let body = "Event-Name: CHANNEL_CREATE\n\
                    Unique-ID: 4f2a\n\
                    variable_sip_to_uri: sip%3A1000%40pbx.example.com\n\
                    Caller-Caller-ID-Name: Jane%20Doe\n\n";
        let event = parse_plain_event(body).expect("parse");
        assert_eq!(event.name(), Some("CHANNEL_CREATE"));
        assert_eq!(event.get("variable_sip_to_uri"), Some("sip:1000@pbx.example.com"));
        assert_eq!(event.get("Caller-Caller-ID-Name"), Some("Jane Doe"));
        assert!(event.body().is_none());
    }

    #[test]
    fn parses_plain_event_body() {
        let body = "Event-Name: CUSTOM\nContent-Length: 5\n\nhello trailing";
        let event = parse_plain_event(body).expect("parse");
        assert_eq!(event.body(), Some("hello"));
    }

    #[test]
    fn truncated_body_is_kept() {
        let body = "Event-Name: CUSTOM\nContent-Length: 50\n\nshort";
        let event = parse_plain_event(body).expect("parse");
        assert_eq!(event.body(), Some("short"));
    }

    #[test]
    fn rejects_empty_event() {
        assert!(parse_plain_event("").is_err());
        assert!(parse_plain_event("garbage line").is_err());
    }

    #[test]
    fn log_frame_becomes_log_event() {
        let frame = EslFrame::new(
            vec![
                (CONTENT_TYPE.to_string(), "log/data".to_string()),
                (CONTENT_LENGTH.to_string(), "11".to_string()),
                ("Log-Level".to_string(), "7".to_string()),
            ],
            Some("hello world".to_string()),
        );
        let event = log_event(frame);
        assert_eq!(event.name(), Some("LOG"));
        assert_eq!(event.get("Log-Level"), Some("7"));
        assert!(event.get(CONTENT_TYPE).is_none());
        assert_eq!(event.body(), Some("hello world"));
    }

    #[test]
    fn esl_errors_map_to_source_errors() {
        let io: SourceError = EslError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).into();
        assert!(matches!(io, SourceError::Io(_)));
        assert!(!io.is_transient());

        let proto: SourceError = EslError::InvalidHeader("x".to_string()).into();
        assert!(proto.is_transient());
    }

    #[test]
    fn new_client_is_disconnected() {
        let client = EslClient::new().with_connect_timeout(Duration::from_secs(1));
        assert!(!client.is_connected());
    }
}
