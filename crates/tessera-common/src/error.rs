//! Error types for Tessera.

use thiserror::Error;

/// Result type alias using TesseraError.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Broad error categories.
///
/// Callers use the category to decide whether an error aborts the current
/// operation or only the record/column that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid setup. Fatal at configuration time.
    Configuration,
    /// A page or mini-page cannot fit the requested bytes.
    Capacity,
    /// A uniqueness constraint rejected the request.
    Constraint,
    /// A field, record or transform could not be resolved for one record.
    Resolution,
    /// A structural invariant is broken. Fatal for the current operation.
    InvariantViolation,
}

/// Errors that can occur in Tessera operations.
#[derive(Debug, Error)]
pub enum TesseraError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    #[error("Too many key columns (max {max})")]
    TooManyColumns { max: usize },

    #[error("Key columns cannot change after the first insert")]
    ColumnsFrozen,

    // Capacity errors
    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("B+ tree node full")]
    NodeFull,

    #[error("Mini-page full: requested {requested} bytes, {available} available")]
    MiniPageFull { requested: usize, available: usize },

    // Constraint errors
    #[error("Duplicate key")]
    DuplicateKey,

    // Resolution errors
    #[error("Field not resolved: {0}")]
    FieldNotResolved(String),

    #[error("Transform failed: {0}")]
    TransformFailed(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Record not found: {0}")]
    RecordNotFound(u64),

    // Invariant violations
    #[error("B+ tree corrupted: {0}")]
    BTreeCorrupted(String),

    #[error("Stale node handle: {0}")]
    StaleNode(String),

    #[error("Invalid access: {0}")]
    InvalidAccess(String),

    #[error("Mini-page corrupted: {0}")]
    MiniPageCorrupted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TesseraError::ConfigError(_)
            | TesseraError::InvalidParameter { .. }
            | TesseraError::TooManyColumns { .. }
            | TesseraError::ColumnsFrozen => ErrorKind::Configuration,

            TesseraError::KeyTooLarge { .. }
            | TesseraError::NodeFull
            | TesseraError::MiniPageFull { .. } => ErrorKind::Capacity,

            TesseraError::DuplicateKey => ErrorKind::Constraint,

            TesseraError::FieldNotResolved(_)
            | TesseraError::TransformFailed(_)
            | TesseraError::TypeMismatch { .. }
            | TesseraError::UnsupportedType(_)
            | TesseraError::RecordNotFound(_) => ErrorKind::Resolution,

            TesseraError::BTreeCorrupted(_)
            | TesseraError::StaleNode(_)
            | TesseraError::InvalidAccess(_)
            | TesseraError::MiniPageCorrupted(_)
            | TesseraError::Internal(_) => ErrorKind::InvariantViolation,
        }
    }

    /// Returns true if the caller may skip the offending record or column
    /// and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Capacity | ErrorKind::Constraint | ErrorKind::Resolution
        )
    }

    /// Shorthand for a type mismatch between two displayable type names.
    pub fn type_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        TesseraError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
