//! Tessera common types, errors, and configuration.
//!
//! This crate provides the definitions shared by the storage and nest crates.

pub mod config;
pub mod error;
pub mod page;
pub mod types;
pub mod value;

pub use config::{IndexConfig, NestConfig};
pub use error::{ErrorKind, Result, TesseraError};
pub use page::{ALIGNMENT, MAX_NODE_SIZE, MIN_NODE_SIZE, NODE_SIZE, align_up};
pub use types::TypeId;
pub use value::Value;
