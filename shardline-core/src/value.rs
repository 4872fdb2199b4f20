//! RESP2 reply values

use crate::error::{RedisError, RedisResult};
use bytes::Bytes;

/// A decoded server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// Null bulk string: $-1\r\n
    Null,
    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
    /// Null array: *-1\r\n
    NullArray,
}

impl RespValue {
    /// Convert to a string if possible
    pub fn as_string(&self) -> RedisResult<String> {
        match self {
            RespValue::SimpleString(s) => Ok(s.clone()),
            RespValue::BulkString(b) => String::from_utf8(b.to_vec())
                .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {}", e))),
            RespValue::Null | RespValue::NullArray => {
                Err(RedisError::Type("Value is null".to_string()))
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {:?} to string",
                self
            ))),
        }
    }

    /// Convert to an integer if possible
    pub fn as_int(&self) -> RedisResult<i64> {
        match self {
            RespValue::Integer(i) => Ok(*i),
            RespValue::BulkString(b) => std::str::from_utf8(b)
                .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {}", e)))?
                .parse::<i64>()
                .map_err(|e| RedisError::Type(format!("Cannot parse integer: {}", e))),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {:?} to integer",
                self
            ))),
        }
    }

    /// Convert to bytes if possible
    pub fn as_bytes(&self) -> RedisResult<Bytes> {
        match self {
            RespValue::BulkString(b) => Ok(b.clone()),
            RespValue::SimpleString(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            RespValue::Null | RespValue::NullArray => {
                Err(RedisError::Type("Value is null".to_string()))
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {:?} to bytes",
                self
            ))),
        }
    }

    /// Borrow the elements of an array reply
    pub fn as_array(&self) -> RedisResult<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Ok(arr),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {:?} to array",
                self
            ))),
        }
    }

    /// Take the elements of an array reply
    pub fn into_array(self) -> RedisResult<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Ok(arr),
            other => Err(RedisError::Type(format!(
                "Cannot convert {:?} to array",
                other
            ))),
        }
    }

    /// Check if this is a null bulk string or a null array
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null | RespValue::NullArray)
    }

    /// Check if this is an error
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Check for the `+OK` status reply
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::SimpleString(s) if s == "OK")
    }

    /// The leading word of an error reply, e.g. `WRONGTYPE`
    pub fn error_code(&self) -> Option<&str> {
        match self {
            RespValue::Error(msg) => msg.split_whitespace().next(),
            _ => None,
        }
    }

    /// Extract error message if this is an error
    pub fn into_error(self) -> Option<String> {
        match self {
            RespValue::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        RespValue::BulkString(Bytes::from(s.into_bytes()))
    }
}

impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        RespValue::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        RespValue::Integer(i)
    }
}

impl From<Vec<u8>> for RespValue {
    fn from(b: Vec<u8>) -> Self {
        RespValue::BulkString(Bytes::from(b))
    }
}

impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        RespValue::BulkString(b)
    }
}

impl From<Vec<RespValue>> for RespValue {
    fn from(items: Vec<RespValue>) -> Self {
        RespValue::Array(items)
    }
}
