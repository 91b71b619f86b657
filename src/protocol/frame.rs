//! STOMP 1.2 frame codec
//!
//! Frames travel as WebSocket text messages. A frame is a command line,
//! header lines, a blank line, the body and a terminating NUL octet. A
//! message made only of end-of-line characters is a heart-beat.

use crate::transport::ConnectHeaders;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Payload sent on an idle connection to keep it alive
pub const HEARTBEAT: &str = "\n";

/// STOMP version negotiated on CONNECT
pub const STOMP_VERSION: &str = "1.2";

/// Frame commands used by the progress subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        match raw {
            "CONNECT" | "STOMP" => Ok(Command::Connect),
            "CONNECTED" => Ok(Command::Connected),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "DISCONNECT" => Ok(Command::Disconnect),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }

    /// CONNECT and CONNECTED headers are sent verbatim, everything else is escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame codec errors
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("Frame is empty")]
    Empty,
    #[error("Unknown frame command: {0}")]
    UnknownCommand(String),
    #[error("Malformed header line: {0}")]
    MalformedHeader(String),
    #[error("Frame is not terminated by a NUL octet")]
    MissingNull,
    #[error("Frame header block is not valid UTF-8")]
    InvalidUtf8,
    #[error("Invalid content-length header: {0}")]
    BadContentLength(String),
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header; repeated headers keep the first occurrence
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// CONNECT frame carrying the bearer token when one is available.
    /// `send_ms` is how often we can heart-beat, `receive_ms` how often we
    /// want the broker to; 0 opts out of that direction.
    pub fn connect(host: &str, send_ms: u64, receive_ms: u64, headers: &ConnectHeaders) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .with_header("accept-version", STOMP_VERSION)
            .with_header("host", host)
            .with_header("heart-beat", format!("{send_ms},{receive_ms}"));
        if let Some(authorization) = &headers.authorization {
            frame = frame.with_header("Authorization", authorization.clone());
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).with_header("id", id)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Broker-side MESSAGE frame, used by fake brokers in tests
    pub fn message(subscription: &str, destination: &str, message_id: &str, body: &str) -> Self {
        Frame::new(Command::Message)
            .with_header("subscription", subscription)
            .with_header("destination", destination)
            .with_header("message-id", message_id)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
    }

    /// Serialize to wire form, adding content-length for non-empty bodies
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');

        let escape = self.command.escapes_headers();
        for (name, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }

        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Parse one frame. Returns `Ok(None)` for a heart-beat.
    pub fn decode(input: &[u8]) -> Result<Option<Frame>, FrameError> {
        let Some(start) = input.iter().position(|b| *b != b'\n' && *b != b'\r') else {
            return Ok(None);
        };
        let data = &input[start..];
        let mut pos = 0;

        let command_line = next_line(data, &mut pos).ok_or(FrameError::Empty)?;
        let command = Command::parse(as_utf8(command_line)?)?;

        let mut headers = Vec::new();
        loop {
            let line = next_line(data, &mut pos).ok_or(FrameError::MissingNull)?;
            if line.is_empty() {
                break;
            }
            let line = as_utf8(line)?;
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let rest = &data[pos..];
        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::BadContentLength(value.clone()))
            })
            .transpose()?;

        let body = match content_length {
            Some(len) => {
                if rest.len() <= len || rest[len] != 0 {
                    return Err(FrameError::MissingNull);
                }
                &rest[..len]
            }
            None => {
                let end = rest
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or(FrameError::MissingNull)?;
                &rest[..end]
            }
        };

        Ok(Some(Frame {
            command,
            headers,
            body: Bytes::copy_from_slice(body),
        }))
    }
}

fn next_line<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let rest = data.get(*pos..)?;
    let newline = rest.iter().position(|b| *b == b'\n')?;
    *pos += newline + 1;
    let line = &rest[..newline];
    Some(line.strip_suffix(b"\r").unwrap_or(line))
}

fn as_utf8(raw: &[u8]) -> Result<&str, FrameError> {
    std::str::from_utf8(raw).map_err(|_| FrameError::InvalidUtf8)
}

fn escape_header(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            ':' => escaped.push_str("\\c"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::MalformedHeader(raw.to_string())),
        }
    }
    Ok(out)
}
