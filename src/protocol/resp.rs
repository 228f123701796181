//! RESP2 framing shared by the data-plane and monitor protocols.
//!
//! Both sides of a conversation use the same [`Frame`] type: clients encode
//! commands as arrays of bulk strings, the built-in monitor listener decodes
//! them and answers with any frame kind.

use crate::common::{Error, Result};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Largest bulk string accepted; control-plane replies stay far below this
const MAX_BULK_LEN: usize = 1024 * 1024;

/// Longest header or simple-string line
const MAX_LINE_LEN: usize = 64 * 1024;

/// Deepest array nesting accepted
const MAX_DEPTH: usize = 32;

/// Unparsed bytes a connection may hold while waiting for a complete frame
const MAX_BUFFER_LEN: usize = 4 * MAX_BULK_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Null,
    Array(Vec<Frame>),
}

impl Frame {
    /// Encode a command as an array of bulk strings
    pub fn command<S: AsRef<str>>(args: &[S]) -> Frame {
        Frame::Array(
            args.iter()
                .map(|a| Frame::Bulk(a.as_ref().as_bytes().to_vec()))
                .collect(),
        )
    }

    pub fn bulk(s: impl AsRef<str>) -> Frame {
        Frame::Bulk(s.as_ref().as_bytes().to_vec())
    }

    pub fn ok() -> Frame {
        Frame::Simple("OK".to_string())
    }

    pub fn error(msg: impl Into<String>) -> Frame {
        Frame::Error(msg.into())
    }

    /// Text content of simple and bulk strings
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Integers, or strings holding an integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            other => other.as_str().and_then(|s| s.parse().ok()),
        }
    }

    pub fn as_array(&self) -> Option<&[Frame]> {
        match self {
            Frame::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    pub fn encode(&self, dst: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                dst.push(b'+');
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(b"\r\n");
            }
            Frame::Error(s) => {
                dst.push(b'-');
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                dst.extend_from_slice(format!(":{}\r\n", n).as_bytes());
            }
            Frame::Bulk(data) => {
                dst.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                dst.extend_from_slice(data);
                dst.extend_from_slice(b"\r\n");
            }
            Frame::Null => dst.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                dst.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(dst);
                }
            }
        }
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; nothing is consumed in
    /// that case.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Frame>> {
        match parse_at(buf, 0, 0)? {
            Some((frame, consumed)) => {
                buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

fn read_line(buf: &[u8], pos: usize) -> Result<Option<(&[u8], usize)>> {
    let Some(rest) = buf.get(pos..) else {
        return Ok(None);
    };
    match rest.windows(2).position(|w| w == b"\r\n") {
        Some(end) if end <= MAX_LINE_LEN => Ok(Some((&rest[..end], pos + end + 2))),
        Some(end) => Err(Error::Protocol(format!("line too long: {} bytes", end))),
        None if rest.len() > MAX_LINE_LEN + 1 => Err(Error::Protocol(format!(
            "line too long: more than {} bytes",
            MAX_LINE_LEN
        ))),
        None => Ok(None),
    }
}

fn parse_len(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("invalid length: {:?}", line)))
}

fn parse_at(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(Frame, usize)>> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };
    let text = || String::from_utf8_lossy(line).into_owned();

    match tag {
        b'+' => Ok(Some((Frame::Simple(text()), next))),
        b'-' => Ok(Some((Frame::Error(text()), next))),
        b':' => Ok(Some((Frame::Integer(parse_len(line)?), next))),
        b'$' => {
            let len = parse_len(line)?;
            if len < 0 {
                return Ok(Some((Frame::Null, next)));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(Error::Protocol(format!("bulk string too large: {}", len)));
            }
            if buf.len() < next + len + 2 {
                return Ok(None);
            }
            if &buf[next + len..next + len + 2] != b"\r\n" {
                return Err(Error::Protocol("bulk string not terminated".into()));
            }
            Ok(Some((Frame::Bulk(buf[next..next + len].to_vec()), next + len + 2)))
        }
        b'*' => {
            let len = parse_len(line)?;
            if len < 0 {
                return Ok(Some((Frame::Null, next)));
            }
            if depth >= MAX_DEPTH {
                return Err(Error::Protocol(format!(
                    "arrays nested deeper than {}",
                    MAX_DEPTH
                )));
            }
            let mut items = Vec::with_capacity((len as usize).min(1024));
            let mut cursor = next;
            for _ in 0..len {
                match parse_at(buf, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(items), cursor)))
        }
        // Inline commands, as typed into a telnet session
        _ => {
            let words = String::from_utf8_lossy(&buf[pos..next - 2])
                .split_whitespace()
                .map(Frame::bulk)
                .collect();
            Ok(Some((Frame::Array(words), next)))
        }
    }
}

/// A framed RESP connection over TCP
pub struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {}:{}", host, port)))?
            .map_err(|e| Error::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Read the next frame; `None` on a clean close
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = Frame::parse(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            if self.buffer.len() > MAX_BUFFER_LEN {
                return Err(Error::Protocol(format!(
                    "incomplete frame exceeds {} bytes",
                    MAX_BUFFER_LEN
                )));
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::ConnectionFailed("connection reset mid-frame".into()));
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut out = Vec::with_capacity(64);
        frame.encode(&mut out);
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send a command and wait for its reply. Error replies become `Error::Server`.
    pub async fn request<S: AsRef<str>>(&mut self, args: &[S]) -> Result<Frame> {
        self.write_frame(&Frame::command(args)).await?;
        match self.read_frame().await? {
            Some(Frame::Error(msg)) => Err(Error::Server(msg)),
            Some(frame) => Ok(frame),
            None => Err(Error::ConnectionFailed("connection closed before reply".into())),
        }
    }

    /// Authenticate when a password is configured
    pub async fn auth(&mut self, password: Option<&str>) -> Result<()> {
        if let Some(password) = password {
            self.request(&["AUTH", password]).await?;
        }
        Ok(())
    }
}
