//! In-memory slotted-page B+Tree.
//!
//! ```text
//!                 [ root (level 2) ]
//!                /                  \
//!      [ internal ] ---------------> [ internal ]      <- right links, high keys
//!      /    |    \                   /          \
//!  [leaf]<->[leaf]<->[leaf] <-> [leaf] <-> [leaf]      <- doubly linked leaves
//! ```
//!
//! - Nodes are fixed-size slotted pages owned by a `NodeArena` and addressed
//!   by generation-checked `NodeId`s.
//! - Every node except the right-most of its level carries a high key, the
//!   inclusive upper bound of the keys below it.
//! - Splits are byte-balanced and propagate through the descent path.
//! - Leaves emptied by deletes or trims are unlinked and freed at once; the
//!   root collapses when it is left with a single child.

// Submodules
pub mod arena;
pub mod constants;
pub mod index;
pub mod node;
pub mod scan;
pub mod types;

// Re-exports for public API
pub use arena::{NodeArena, NodeId};
pub use constants::{item_capacity, max_item_footprint};
pub use index::{BTreeIndex, PathFrame, Upsert};
pub use scan::{BTreeScan, ScanEntry, ScanKey, ScanOp};
pub use types::{
    KeyColumn, KeyContext, KeyDatum, KeySchema, KeyStrategy, ScanDirection, SlotTable, TrimEnd,
    compare_values, key_of,
};
