//! RESP2 protocol implementation
//!
//! This module implements the Redis Serialization Protocol (RESP2) for
//! encoding commands and decoding replies.
//!
//! Decoding runs in two passes. [`RespDecoder::check`] walks headers and
//! lengths without allocating and can resume where a previous call stopped,
//! so a reply arriving in many reads is scanned once. [`RespDecoder::parse`]
//! then builds the value from the complete frame. Nesting is tracked on an
//! explicit stack and capped at [`MAX_DEPTH`].

use bytes::{BufMut, Bytes, BytesMut};
use shardline_core::{
    error::{RedisError, RedisResult},
    types::Command,
    value::RespValue,
};
use std::io::Cursor;
use std::ops::Range;

const CRLF: &[u8] = b"\r\n";

/// Upper bound on elements pre-allocated for one array header.
const MAX_PREALLOC: usize = 1024;

/// Deepest array nesting accepted in a reply
pub const MAX_DEPTH: usize = 512;

/// Encodes commands and values into bytes
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a command as an array of bulk strings
    pub fn encode_command(command: &Command, buf: &mut BytesMut) {
        let parts = command.parts();
        Self::put_header(b'*', parts.len(), buf);

        for part in parts {
            Self::put_bulk(part, buf);
        }
    }

    /// Encode a reply value
    pub fn encode(value: &RespValue, buf: &mut BytesMut) {
        let mut stack = vec![std::slice::from_ref(value).iter()];

        while let Some(items) = stack.last_mut() {
            let Some(value) = items.next() else {
                stack.pop();
                continue;
            };
            match value {
                RespValue::SimpleString(s) => Self::put_line(b'+', s.as_bytes(), buf),
                RespValue::Error(e) => Self::put_line(b'-', e.as_bytes(), buf),
                RespValue::Integer(i) => Self::put_line(b':', i.to_string().as_bytes(), buf),
                RespValue::BulkString(data) => Self::put_bulk(data, buf),
                RespValue::Null => buf.put_slice(b"$-1\r\n"),
                RespValue::NullArray => buf.put_slice(b"*-1\r\n"),
                RespValue::Array(arr) => {
                    Self::put_header(b'*', arr.len(), buf);
                    stack.push(arr.iter());
                }
            }
        }
    }

    fn put_line(tag: u8, line: &[u8], buf: &mut BytesMut) {
        buf.put_u8(tag);
        buf.put_slice(line);
        buf.put_slice(CRLF);
    }

    fn put_header(tag: u8, len: usize, buf: &mut BytesMut) {
        Self::put_line(tag, len.to_string().as_bytes(), buf);
    }

    fn put_bulk(data: &[u8], buf: &mut BytesMut) {
        buf.reserve(data.len() + 16);
        Self::put_header(b'$', data.len(), buf);
        buf.put_slice(data);
        buf.put_slice(CRLF);
    }
}

/// One header with the byte ranges of its payload
enum Header {
    Simple(Range<usize>),
    Error(Range<usize>),
    Integer(i64),
    Bulk(Option<Range<usize>>),
    Array(Option<usize>),
}

/// Progress of [`RespDecoder::check`] over a partially received reply.
///
/// Only whole headers (and whole bulk payloads) are ever consumed, so the
/// scan can stop at any read boundary and pick up from the same offset once
/// more bytes arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameScan {
    offset: usize,
    // elements still missing from the frame
    pending: u64,
}

impl Default for FrameScan {
    fn default() -> Self {
        Self {
            offset: 0,
            pending: 1,
        }
    }
}

impl FrameScan {
    /// Bytes of the frame already verified
    pub fn scanned(&self) -> usize {
        self.offset
    }
}

/// Decodes RESP values from bytes
pub struct RespDecoder;

impl RespDecoder {
    /// Decode one complete value from the buffer.
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold a full value; the
    /// cursor is then left where it started.
    pub fn decode(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        let start = buf.position() as usize;
        let data: &[u8] = buf.get_ref();
        let data = data.get(start..).unwrap_or_default();

        let len = match Self::check(data, &mut FrameScan::default())? {
            Some(len) => len,
            None => return Ok(None),
        };
        let value = Self::parse(&Bytes::copy_from_slice(&data[..len]))?;
        buf.set_position((start + len) as u64);
        Ok(Some(value))
    }

    /// Find the end of the first frame in `buf` without building it.
    ///
    /// Returns the frame length once it is complete. `Ok(None)` means more
    /// bytes are needed; pass the same `scan` again after appending them.
    pub fn check(buf: &[u8], scan: &mut FrameScan) -> RedisResult<Option<usize>> {
        while scan.pending > 0 {
            let (header, next) = match Self::header(buf, scan.offset)? {
                Some(found) => found,
                None => return Ok(None),
            };
            scan.offset = next;
            scan.pending -= 1;
            if let Header::Array(Some(len)) = header {
                scan.pending = scan.pending.saturating_add(len as u64);
            }
        }
        Ok(Some(scan.offset))
    }

    /// Build the value of a complete frame, as delimited by [`check`].
    ///
    /// Bulk strings share the frame's memory.
    ///
    /// [`check`]: RespDecoder::check
    pub fn parse(frame: &Bytes) -> RedisResult<RespValue> {
        // (elements still expected, elements read so far)
        let mut stack: Vec<(usize, Vec<RespValue>)> = Vec::new();
        let mut pos = 0;

        'read: loop {
            let (header, next) = Self::header(frame, pos)?
                .ok_or_else(|| RedisError::Protocol("Truncated frame".to_string()))?;
            pos = next;

            let mut value = match header {
                Header::Simple(line) => RespValue::SimpleString(Self::utf8(&frame[line])?),
                Header::Error(line) => RespValue::Error(Self::utf8(&frame[line])?),
                Header::Integer(i) => RespValue::Integer(i),
                Header::Bulk(None) => RespValue::Null,
                Header::Bulk(Some(data)) => RespValue::BulkString(frame.slice(data)),
                Header::Array(None) => RespValue::NullArray,
                Header::Array(Some(0)) => RespValue::Array(Vec::new()),
                Header::Array(Some(len)) => {
                    if stack.len() >= MAX_DEPTH {
                        return Err(RedisError::Protocol("nesting too deep".to_string()));
                    }
                    stack.push((len, Vec::with_capacity(len.min(MAX_PREALLOC))));
                    continue 'read;
                }
            };

            while let Some((remaining, mut items)) = stack.pop() {
                items.push(value);
                if remaining > 1 {
                    stack.push((remaining - 1, items));
                    continue 'read;
                }
                value = RespValue::Array(items);
            }

            return Ok(value);
        }
    }

    /// Read the header starting at `pos`, and the payload of a bulk string.
    fn header(buf: &[u8], pos: usize) -> RedisResult<Option<(Header, usize)>> {
        let tag = match buf.get(pos) {
            Some(&tag) => tag,
            None => return Ok(None),
        };
        if !matches!(tag, b'+' | b'-' | b':' | b'$' | b'*') {
            return Err(RedisError::Protocol(format!(
                "Invalid RESP type byte: {:?}",
                tag as char
            )));
        }

        let start = pos + 1;
        let offset = match buf[start..].windows(2).position(|w| w == CRLF) {
            Some(offset) => offset,
            None => return Ok(None),
        };
        let line = start..start + offset;
        let next = line.end + 2;

        let header = match tag {
            b'+' => Header::Simple(line),
            b'-' => Header::Error(line),
            b':' => Header::Integer(Self::integer(&buf[line])?),
            b'$' => match Self::integer(&buf[line])? {
                -1 => Header::Bulk(None),
                len if len < 0 => {
                    return Err(RedisError::Protocol(format!(
                        "Invalid bulk string length: {}",
                        len
                    )))
                }
                len => {
                    let end = next.saturating_add(len as usize);
                    if buf.len() < end.saturating_add(2) {
                        return Ok(None);
                    }
                    if &buf[end..end + 2] != CRLF {
                        return Err(RedisError::Protocol(
                            "Bulk string not terminated by CRLF".to_string(),
                        ));
                    }
                    return Ok(Some((Header::Bulk(Some(next..end)), end + 2)));
                }
            },
            _ => match Self::integer(&buf[line])? {
                -1 => Header::Array(None),
                len if len < 0 => {
                    return Err(RedisError::Protocol(format!(
                        "Invalid array length: {}",
                        len
                    )))
                }
                len => Header::Array(Some(len as usize)),
            },
        };

        Ok(Some((header, next)))
    }

    fn utf8(line: &[u8]) -> RedisResult<String> {
        String::from_utf8(line.to_vec())
            .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {}", e)))
    }

    fn integer(line: &[u8]) -> RedisResult<i64> {
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                RedisError::Protocol(format!(
                    "Invalid integer: {:?}",
                    String::from_utf8_lossy(line)
                ))
            })
    }
}
