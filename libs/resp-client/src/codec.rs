//! RESP2 framing for `tokio_util::codec::Framed`.
//!
//! The same codec serves both directions: clients encode [`Command`]s (as
//! arrays of bulk strings) and decode replies, test servers do the opposite.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RespError;

const CRLF: &[u8] = b"\r\n";

/// Redis caps bulk strings at 512 MiB.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
const MAX_ARRAY_LEN: usize = 1024 * 1024;
const MAX_LINE_LEN: usize = 64 * 1024;
const MAX_DEPTH: usize = 32;

/// A single RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string (`$-1`).
    BulkString(Option<Bytes>),
    /// `None` is the null array (`*-1`).
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Build a bulk string from anything byte-like.
    pub fn bulk(data: impl AsRef<[u8]>) -> Self {
        Self::BulkString(Some(Bytes::copy_from_slice(data.as_ref())))
    }

    /// Interpret a simple or bulk string as UTF-8 text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::SimpleString(s) => Some(s),
            Self::BulkString(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

/// A request: command name plus arguments, sent as an array of bulk strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    args: Vec<Bytes>,
}

impl Command {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    #[must_use]
    pub fn arg_int(self, value: i64) -> Self {
        self.arg(value.to_string())
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn into_value(self) -> RespValue {
        let mut items = Vec::with_capacity(self.args.len() + 1);
        items.push(RespValue::bulk(self.name));
        items.extend(self.args.into_iter().map(|a| RespValue::BulkString(Some(a))));
        RespValue::Array(Some(items))
    }
}

impl From<Command> for RespValue {
    fn from(cmd: Command) -> Self {
        cmd.into_value()
    }
}

/// Stateless RESP2 encoder/decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        match parse(&src[..], 0, 0)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), RespError> {
        write_value(&item, dst)
    }
}

/// Parse one value starting at `pos`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete value;
/// nothing is consumed in that case.
fn parse(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(RespValue, usize)>, RespError> {
    if depth > MAX_DEPTH {
        return Err(RespError::protocol("array nesting too deep"));
    }
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };

    match tag {
        b'+' => Ok(Some((RespValue::SimpleString(utf8(line)?), next))),
        b'-' => Ok(Some((RespValue::Error(utf8(line)?), next))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), next))),
        b'$' => {
            let Some(len) = parse_len(line, MAX_BULK_LEN, "bulk string")? else {
                return Ok(Some((RespValue::BulkString(None), next)));
            };
            let end = next + len;
            let Some(terminator) = buf.get(end..end + CRLF.len()) else {
                return Ok(None);
            };
            if terminator != CRLF {
                return Err(RespError::protocol("bulk string not terminated by CRLF"));
            }
            let data = Bytes::copy_from_slice(&buf[next..end]);
            Ok(Some((RespValue::BulkString(Some(data)), end + CRLF.len())))
        }
        b'*' => {
            let Some(len) = parse_len(line, MAX_ARRAY_LEN, "array")? else {
                return Ok(Some((RespValue::Array(None), next)));
            };
            let mut items = Vec::with_capacity(len.min(64));
            let mut cursor = next;
            for _ in 0..len {
                let Some((item, after)) = parse(buf, cursor, depth + 1)? else {
                    return Ok(None);
                };
                items.push(item);
                cursor = after;
            }
            Ok(Some((RespValue::Array(Some(items)), cursor)))
        }
        other => Err(RespError::protocol(format!(
            "unknown type byte 0x{other:02x}"
        ))),
    }
}

fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, RespError> {
    let Some(rest) = buf.get(start..) else {
        return Ok(None);
    };
    match rest.windows(CRLF.len()).position(|w| w == CRLF) {
        Some(idx) => Ok(Some((&rest[..idx], start + idx + CRLF.len()))),
        None if rest.len() > MAX_LINE_LEN => Err(RespError::protocol(format!(
            "header line exceeds {MAX_LINE_LEN} bytes"
        ))),
        None => Ok(None),
    }
}

fn utf8(line: &[u8]) -> Result<String, RespError> {
    std::str::from_utf8(line)
        .map(str::to_owned)
        .map_err(|e| RespError::protocol(format!("invalid UTF-8 in reply: {e}")))
}

fn parse_int(line: &[u8]) -> Result<i64, RespError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| RespError::protocol("non-ASCII integer"))?;
    text.parse::<i64>()
        .map_err(|e| RespError::protocol(format!("invalid integer '{text}': {e}")))
}

/// Parse a length header; `-1` means null.
fn parse_len(line: &[u8], max: usize, what: &str) -> Result<Option<usize>, RespError> {
    let raw = parse_int(line)?;
    if raw == -1 {
        return Ok(None);
    }
    let len = usize::try_from(raw)
        .map_err(|_| RespError::protocol(format!("invalid {what} length {raw}")))?;
    if len > max {
        return Err(RespError::protocol(format!(
            "{what} length {len} exceeds limit {max}"
        )));
    }
    Ok(Some(len))
}

fn write_line(dst: &mut BytesMut, tag: u8, body: &[u8]) {
    dst.put_u8(tag);
    dst.extend_from_slice(body);
    dst.extend_from_slice(CRLF);
}

fn write_value(value: &RespValue, dst: &mut BytesMut) -> Result<(), RespError> {
    match value {
        RespValue::SimpleString(s) | RespValue::Error(s)
            if s.bytes().any(|b| b == b'\r' || b == b'\n') =>
        {
            return Err(RespError::protocol("simple strings cannot contain CR or LF"));
        }
        RespValue::SimpleString(s) => write_line(dst, b'+', s.as_bytes()),
        RespValue::Error(s) => write_line(dst, b'-', s.as_bytes()),
        RespValue::Integer(n) => write_line(dst, b':', n.to_string().as_bytes()),
        RespValue::BulkString(None) => write_line(dst, b'$', b"-1"),
        RespValue::BulkString(Some(data)) => {
            write_line(dst, b'$', data.len().to_string().as_bytes());
            dst.extend_from_slice(data);
            dst.extend_from_slice(CRLF);
        }
        RespValue::Array(None) => write_line(dst, b'*', b"-1"),
        RespValue::Array(Some(items)) => {
            write_line(dst, b'*', items.len().to_string().as_bytes());
            for item in items {
                write_value(item, dst)?;
            }
        }
    }
    Ok(())
}
