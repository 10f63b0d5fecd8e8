//! Column types shared by GROUP BY keys and aggregate inputs.

use serde::{Deserialize, Serialize};

/// The type a key column or accumulator is bound to.
///
/// Types are never declared up front: a key column takes the type of the
/// first value seen for it, and an aggregate column is bound on its first
/// non-NULL input. The discriminants are stable and appear in encoded keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeId {
    /// Placeholder for a column that has only ever seen NULL.
    Null = 0,
    Boolean = 1,
    Int32 = 12,
    Int64 = 13,
    Float64 = 31,
    Text = 52,
    Binary = 60,
    Timestamp = 72,
}

impl TypeId {
    /// Encoded width of a value, or None when it carries a length prefix.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            TypeId::Null => Some(0),
            TypeId::Boolean => Some(1),
            TypeId::Int32 => Some(4),
            TypeId::Int64 | TypeId::Float64 | TypeId::Timestamp => Some(8),
            TypeId::Text | TypeId::Binary => None,
        }
    }

    /// Inputs accepted by SUM, AVG and the variance family.
    pub fn is_numeric(&self) -> bool {
        matches!(self, TypeId::Int32 | TypeId::Int64 | TypeId::Float64)
    }

    /// Types whose SUM stays exact in an `i64`.
    pub fn is_integer(&self) -> bool {
        matches!(self, TypeId::Int32 | TypeId::Int64 | TypeId::Timestamp)
    }

    pub fn is_variable(&self) -> bool {
        self.fixed_size().is_none()
    }

    /// Bytes a MIN/MAX slot needs to hold one value of this type in place.
    ///
    /// Variable-length types and the NULL placeholder have no such slot.
    pub fn extreme_width(&self) -> Option<usize> {
        match self {
            TypeId::Null => None,
            other => other.fixed_size(),
        }
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TypeId::Null => "NULL",
            TypeId::Boolean => "BOOLEAN",
            TypeId::Int32 => "INT32",
            TypeId::Int64 => "INT64",
            TypeId::Float64 => "FLOAT64",
            TypeId::Text => "TEXT",
            TypeId::Binary => "BINARY",
            TypeId::Timestamp => "TIMESTAMP",
        })
    }
}
