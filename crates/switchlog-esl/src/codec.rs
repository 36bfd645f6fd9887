//! Event socket wire framing.
//!
//! Every message from the switch is a block of `Name: value` lines ended by
//! a blank line, optionally followed by exactly `Content-Length` bytes of
//! body. Commands we send are a single line followed by a blank line.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Header naming the kind of frame.
pub const CONTENT_TYPE: &str = "Content-Type";

/// Header giving the body length in bytes.
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Header carrying a command's result.
pub const REPLY_TEXT: &str = "Reply-Text";

/// Largest header block accepted before giving up on a peer.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Largest body accepted.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\n\n";

/// Wire-level errors.
#[derive(Debug, Error)]
pub enum EslError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A header line was not `Name: value`.
    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),

    /// `Content-Length` was not a usable number.
    #[error("invalid content length: {0:?}")]
    InvalidContentLength(String),

    /// The peer sent more than we are willing to buffer.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// One decoded message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EslFrame {
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl EslFrame {
    /// Creates a frame from parts.
    #[must_use]
    pub fn new(headers: Vec<(String, String)>, body: Option<String>) -> Self {
        Self { headers, body }
    }

    /// Returns the first header with this name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All headers in arrival order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The frame's `Content-Type`.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE)
    }

    /// The body, if one was sent.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Consumes the frame, returning its body.
    #[must_use]
    pub fn into_body(self) -> Option<String> {
        self.body
    }

    /// The `Reply-Text` of a command reply.
    #[must_use]
    pub fn reply_text(&self) -> Option<&str> {
        self.header(REPLY_TEXT)
    }

    /// Returns true if this is a command reply starting with `+OK`.
    #[must_use]
    pub fn is_ok_reply(&self) -> bool {
        self.reply_text().is_some_and(|t| t.starts_with("+OK"))
    }
}

/// Parses a `Name: value` block. Blank lines are ignored.
pub fn parse_header_block(block: &str) -> Result<Vec<(String, String)>, EslError> {
    block
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .map(|line| {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| EslError::InvalidHeader(line.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(EslError::InvalidHeader(line.to_string()));
            }
            Ok((name.to_string(), value.trim_start().to_string()))
        })
        .collect()
}

/// Parses a `Content-Length` value.
pub fn parse_content_length(value: &str) -> Result<usize, EslError> {
    let len: usize = value
        .trim()
        .parse()
        .map_err(|_| EslError::InvalidContentLength(value.to_string()))?;
    if len > MAX_BODY_BYTES {
        return Err(EslError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Codec for [`EslFrame`]s in and command lines out.
#[derive(Debug, Default)]
pub struct EslCodec {
    /// Header block of a frame whose body has not fully arrived.
    pending: Option<(Vec<(String, String)>, usize)>,
}

impl EslCodec {
    /// Creates a codec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for EslCodec {
    type Item = EslFrame;
    type Error = EslError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.pending.is_none() {
            // Stray blank lines between frames.
            let leading = src.iter().take_while(|b| matches!(b, b'\n' | b'\r')).count();
            src.advance(leading);

            let Some(end) = find(src, HEADER_TERMINATOR) else {
                if src.len() > MAX_HEADER_BYTES {
                    return Err(EslError::FrameTooLarge(src.len()));
                }
                return Ok(None);
            };

            let block = src.split_to(end + HEADER_TERMINATOR.len());
            let headers = parse_header_block(&String::from_utf8_lossy(&block))?;
            let length = headers
                .iter()
                .find(|(k, _)| k == CONTENT_LENGTH)
                .map(|(_, v)| parse_content_length(v))
                .transpose()?
                .unwrap_or(0);
            self.pending = Some((headers, length));
        }

        let Some((_, length)) = &self.pending else {
            return Ok(None);
        };
        let length = *length;
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let Some((headers, _)) = self.pending.take() else {
            return Ok(None);
        };
        let body = (length > 0).then(|| String::from_utf8_lossy(&src.split_to(length)).into_owned());
        Ok(Some(EslFrame::new(headers, body)))
    }
}

impl Encoder<String> for EslCodec {
    type Error = EslError;

    fn encode(&mut self, command: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = command.trim_end();
        dst.reserve(command.len() + HEADER_TERMINATOR.len());
        dst.put_slice(command.as_bytes());
        dst.put_slice(HEADER_TERMINATOR);
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
