//! Newline-delimited frame codec.
//!
//! Two frame shapes share one line-oriented wire format:
//!
//! ```text
//! input frame:  <escaped text>\n
//! relay frame:  :<sender> <rfc3339 timestamp> <kind> <escaped payload>\n
//! ```
//!
//! Input frames are what a peer types (chat text or a `/command`). Relay
//! frames are fully attributed messages sent by the server. Backslash, CR and
//! LF are escaped inside text; an input line that would start with `:` is
//! written as `\:` so it cannot be mistaken for a relay header.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::codec::{Decoder, Encoder};

use crate::chat::{Message, MessageKind, MAX_NAME_LEN};
use crate::{PeerchatError, Result};

/// Marker that starts a relay frame header.
const RELAY_MARKER: u8 = b':';

/// Room reserved for the relay header on top of the escaped payload. The
/// sender is capped at [`MAX_NAME_LEN`], so a header never comes close.
const HEADER_ALLOWANCE: usize = 512;

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A raw line from a peer: chat text or a command line.
    Input(String),
    /// A fully attributed message relayed by the server.
    Relay(Message),
}

impl Frame {
    /// Text carried by the frame, used for the payload limit.
    pub fn payload(&self) -> &str {
        match self {
            Frame::Input(text) => text,
            Frame::Relay(message) => &message.payload,
        }
    }
}

/// Codec for [`Frame`]s.
///
/// One codec instance is used per connection direction; it keeps the scan
/// position of a partially received line between calls.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
    next_index: usize,
}

impl FrameCodec {
    /// Create a codec that accepts payloads up to `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.max(1),
            next_index: 0,
        }
    }

    /// Maximum payload size in bytes.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Longest raw line accepted before the stream is considered malformed.
    fn max_line_len(&self) -> usize {
        self.max_payload * 2 + HEADER_ALLOWANCE
    }

    /// Check that a frame can be encoded.
    pub fn validate(&self, frame: &Frame) -> Result<()> {
        let len = frame.payload().len();
        if len > self.max_payload {
            return Err(PeerchatError::MessageTooLarge {
                len,
                max: self.max_payload,
            });
        }
        if let Frame::Relay(message) = frame {
            if message.sender.is_empty()
                || message.sender.len() > MAX_NAME_LEN
                || message.sender.chars().any(char::is_whitespace)
            {
                return Err(PeerchatError::Protocol(format!(
                    "invalid sender {:?}",
                    message.sender
                )));
            }
        }
        Ok(())
    }

    fn parse_line(&self, line: &[u8]) -> Result<Frame> {
        let line = std::str::from_utf8(line)
            .map_err(|_| PeerchatError::Protocol("frame is not valid UTF-8".to_string()))?;

        let frame = match line.strip_prefix(RELAY_MARKER as char) {
            Some(rest) => Frame::Relay(parse_relay(rest)?),
            None => Frame::Input(unescape(line)?),
        };

        let len = frame.payload().len();
        if len > self.max_payload {
            return Err(PeerchatError::Protocol(format!(
                "payload of {len} bytes exceeds limit of {}",
                self.max_payload
            )));
        }
        Ok(frame)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(4096)
    }
}

fn parse_relay(header: &str) -> Result<Message> {
    let mut parts = header.splitn(4, ' ');
    let (sender, timestamp, kind, payload) =
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(s), Some(t), Some(k), Some(p)) if !s.is_empty() && s.len() <= MAX_NAME_LEN => {
                (s, t, k, p)
            }
            _ => {
                return Err(PeerchatError::Protocol(
                    "truncated relay header".to_string(),
                ))
            }
        };

    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| PeerchatError::Protocol(format!("bad timestamp {timestamp:?}: {e}")))?
        .with_timezone(&Utc);
    let kind = MessageKind::parse(kind)
        .ok_or_else(|| PeerchatError::Protocol(format!("unknown message kind {kind:?}")))?;

    Ok(Message::new(sender, kind, unescape(payload)?, timestamp))
}

fn escape_into(text: &str, dst: &mut BytesMut, guard_marker: bool) {
    for (i, ch) in text.char_indices() {
        match ch {
            '\\' => dst.put_slice(b"\\\\"),
            '\n' => dst.put_slice(b"\\n"),
            '\r' => dst.put_slice(b"\\r"),
            ':' if i == 0 && guard_marker => dst.put_slice(b"\\:"),
            c => {
                let mut buf = [0u8; 4];
                dst.put_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn unescape(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(':') => out.push(':'),
            Some(other) => {
                return Err(PeerchatError::Protocol(format!(
                    "unknown escape sequence \\{other}"
                )))
            }
            None => {
                return Err(PeerchatError::Protocol(
                    "dangling escape at end of frame".to_string(),
                ))
            }
        }
    }
    Ok(out)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = PeerchatError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        let read_to = buf.len();
        let newline = buf[self.next_index..read_to]
            .iter()
            .position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let newline_index = self.next_index + offset;
                self.next_index = 0;
                let line = buf.split_to(newline_index + 1);
                let mut line = &line[..newline_index];
                if let Some(stripped) = line.strip_suffix(b"\r") {
                    line = stripped;
                }
                self.parse_line(line).map(Some)
            }
            None if read_to > self.max_line_len() => {
                buf.clear();
                self.next_index = 0;
                Err(PeerchatError::Protocol(format!(
                    "frame exceeds {} bytes without a delimiter",
                    self.max_line_len()
                )))
            }
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => {
                buf.clear();
                self.next_index = 0;
                Err(PeerchatError::Protocol(
                    "connection closed in the middle of a frame".to_string(),
                ))
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PeerchatError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        self.validate(&frame)?;

        match &frame {
            Frame::Input(text) => {
                dst.reserve(text.len() + 2);
                escape_into(text, dst, true);
            }
            Frame::Relay(message) => {
                let timestamp = message
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true);
                dst.reserve(message.sender.len() + timestamp.len() + message.payload.len() + 16);
                dst.put_u8(RELAY_MARKER);
                dst.put_slice(message.sender.as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(timestamp.as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(message.kind.as_str().as_bytes());
                dst.put_u8(b' ');
                escape_into(&message.payload, dst, false);
            }
        }
        dst.put_u8(b'\n');
        Ok(())
    }
}
