//! Runtime values and their comparison and binary encoding.
//!
//! `Value` is the comparator/serializer used by index key columns and by
//! accumulators. Ordering rules:
//! - NULL sorts after every non-null value and equal to another NULL.
//! - Integers, timestamps and floats compare numerically across types.
//! - Values of otherwise unrelated types order by their `TypeId` tag.

use crate::error::{Result, TesseraError};
use crate::types::TypeId;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Binary(Vec<u8>),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
}

impl Value {
    /// Returns the type of this value.
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Null => TypeId::Null,
            Value::Boolean(_) => TypeId::Boolean,
            Value::Int32(_) => TypeId::Int32,
            Value::Int64(_) => TypeId::Int64,
            Value::Float64(_) => TypeId::Float64,
            Value::Text(_) => TypeId::Text,
            Value::Binary(_) => TypeId::Binary,
            Value::Timestamp(_) => TypeId::Timestamp,
        }
    }

    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the value as an i64 if it is integer-like.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) | Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as an f64 if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) | Value::Timestamp(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// Total ordering used by key comparison.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Greater,
            (_, Value::Null) => Ordering::Less,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::Float64(_), _) | (_, Value::Float64(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a.total_cmp(&b),
                    _ => (self.type_id() as u8).cmp(&(other.type_id() as u8)),
                }
            }
            _ => match (self.as_i64(), other.as_i64()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => (self.type_id() as u8).cmp(&(other.type_id() as u8)),
            },
        }
    }

    /// Converts this value to `target`, if the conversion is lossless.
    ///
    /// NULL converts to every type.
    pub fn cast(&self, target: TypeId) -> Option<Value> {
        if self.is_null() || self.type_id() == target {
            return Some(self.clone());
        }
        match (self, target) {
            (Value::Int32(v), TypeId::Int64) => Some(Value::Int64(*v as i64)),
            (Value::Int32(v), TypeId::Timestamp) => Some(Value::Timestamp(*v as i64)),
            (Value::Int32(v), TypeId::Float64) => Some(Value::Float64(*v as f64)),
            (Value::Int64(v), TypeId::Int32) => i32::try_from(*v).ok().map(Value::Int32),
            (Value::Int64(v), TypeId::Timestamp) => Some(Value::Timestamp(*v)),
            (Value::Int64(v), TypeId::Float64) => Some(Value::Float64(*v as f64)),
            (Value::Timestamp(v), TypeId::Int64) => Some(Value::Int64(*v)),
            (Value::Text(s), TypeId::Binary) => Some(Value::Binary(s.as_bytes().to_vec())),
            _ => None,
        }
    }

    /// Like `cast`, but reports a type mismatch instead of returning None.
    pub fn cast_to(&self, target: TypeId) -> Result<Value> {
        self.cast(target)
            .ok_or_else(|| TesseraError::type_mismatch(target, self.type_id()))
    }

    /// Number of bytes `encode_binary` writes for this value.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Text(s) => s.len(),
            Value::Binary(b) => b.len(),
            other => other.type_id().fixed_size().unwrap_or(0),
        }
    }

    /// Appends the binary form of this value to `buf`.
    ///
    /// Fixed-size types are written little-endian. Variable-length types are
    /// written raw; callers that need framing add their own length prefix.
    pub fn encode_binary(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => {}
            Value::Boolean(v) => buf.put_u8(*v as u8),
            Value::Int32(v) => buf.put_i32_le(*v),
            Value::Int64(v) | Value::Timestamp(v) => buf.put_i64_le(*v),
            Value::Float64(v) => buf.put_f64_le(*v),
            Value::Text(s) => buf.put_slice(s.as_bytes()),
            Value::Binary(b) => buf.put_slice(b),
        }
    }

    /// Decodes a value of type `type_id` from exactly `buf`.
    pub fn decode_binary(type_id: TypeId, buf: &[u8]) -> Result<Value> {
        if let Some(size) = type_id.fixed_size()
            && buf.len() != size
        {
            return Err(TesseraError::Internal(format!(
                "{} value needs {} bytes, got {}",
                type_id,
                size,
                buf.len()
            )));
        }
        let value = match type_id {
            TypeId::Null => Value::Null,
            TypeId::Boolean => Value::Boolean(buf[0] != 0),
            TypeId::Int32 => Value::Int32(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            TypeId::Int64 => Value::Int64(i64::from_le_bytes(fixed8(buf))),
            TypeId::Timestamp => Value::Timestamp(i64::from_le_bytes(fixed8(buf))),
            TypeId::Float64 => Value::Float64(f64::from_le_bytes(fixed8(buf))),
            TypeId::Text => Value::Text(
                String::from_utf8(buf.to_vec())
                    .map_err(|e| TesseraError::Internal(format!("invalid utf-8 text: {e}")))?,
            ),
            TypeId::Binary => Value::Binary(buf.to_vec()),
        };
        Ok(value)
    }
}

fn fixed8(buf: &[u8]) -> [u8; 8] {
    [
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ]
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "'{}'", v),
            Value::Binary(v) => write!(f, "x'{}'", v.iter().map(|b| format!("{b:02x}")).collect::<String>()),
            Value::Timestamp(v) => write!(f, "ts:{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
