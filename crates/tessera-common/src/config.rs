//! Configuration structures for Tessera indexes and nests.

use crate::error::{Result, TesseraError};
use crate::page::{MAX_NODE_SIZE, MIN_NODE_SIZE, NODE_SIZE};
use serde::{Deserialize, Serialize};

/// Default maximum number of key columns per index.
pub const MAX_KEY_COLUMNS: usize = 10;

/// Default leaf value budget for nest indexes (mini-page size).
pub const DEFAULT_NEST_VALUE_SIZE: usize = 256;

/// Smallest mini-page that holds one 8-byte region: an 8-byte header and
/// one 8-byte directory entry in front of it.
pub const MIN_NEST_VALUE_SIZE: usize = 24;

/// Configuration for a single ordered index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Node (page) size in bytes.
    pub node_size: usize,
    /// Fixed number of value bytes stored with every leaf key.
    pub value_size: usize,
    /// Reject duplicate keys.
    pub unique: bool,
    /// Maximum number of key columns.
    pub max_key_columns: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            node_size: NODE_SIZE,
            value_size: 8,
            unique: true,
            max_key_columns: MAX_KEY_COLUMNS,
        }
    }
}

impl IndexConfig {
    /// Checks that every field is within the supported range.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&self.node_size) {
            return Err(TesseraError::InvalidParameter {
                name: "node_size".to_string(),
                value: self.node_size.to_string(),
            });
        }
        if self.max_key_columns == 0 || self.max_key_columns > MAX_KEY_COLUMNS {
            return Err(TesseraError::InvalidParameter {
                name: "max_key_columns".to_string(),
                value: self.max_key_columns.to_string(),
            });
        }
        // Leaf items are capped at a quarter of the node, so a value may
        // take at most half of that.
        if self.value_size > self.node_size / 16 {
            return Err(TesseraError::ConfigError(format!(
                "value_size {} too large for node_size {}",
                self.value_size, self.node_size
            )));
        }
        Ok(())
    }
}

/// Configuration for a nest and the indexes it creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NestConfig {
    /// Node size used by every nest index.
    pub node_size: usize,
    /// Mini-page budget stored in every leaf.
    pub value_size: usize,
}

impl Default for NestConfig {
    fn default() -> Self {
        Self {
            node_size: NODE_SIZE,
            value_size: DEFAULT_NEST_VALUE_SIZE,
        }
    }
}

impl NestConfig {
    /// Returns the index configuration used for nest indexes.
    ///
    /// Nest indexes are always unique: one leaf entry per group.
    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            node_size: self.node_size,
            value_size: self.value_size,
            unique: true,
            max_key_columns: MAX_KEY_COLUMNS,
        }
    }

    /// Checks that the derived index configuration is valid.
    pub fn validate(&self) -> Result<()> {
        if self.value_size < MIN_NEST_VALUE_SIZE {
            return Err(TesseraError::InvalidParameter {
                name: "value_size".to_string(),
                value: self.value_size.to_string(),
            });
        }
        self.index_config().validate()
    }
}
