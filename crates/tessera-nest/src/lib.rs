//! Incremental GROUP BY aggregation for Tessera.
//!
//! A `Nest` owns a set of GROUP BY indexes (`NestIdx`) and the levels that
//! aggregate into them (`NestLevel`). Each record is routed to every index;
//! its group key selects one B+Tree leaf entry whose value is a mini-page
//! of accumulator state:
//!
//! ```text
//! record --> NestIdx "ts" (time, sensor) --upsert--> leaf value (mini-page)
//!                                                      | (level 0, item 0) COUNT
//!                                                      | (level 0, item 1) AVG
//! ```
//!
//! Levels grouping on fewer columns than their index fill the remaining key
//! columns with NULL, so one tree can hold several grouping granularities.

pub mod accum;
pub mod column;
pub mod level;
pub mod minipage;
pub mod nest;
pub mod nest_idx;

pub use accum::{Accumulator, AccumulatorFactory, AggregateKind};
pub use column::{FnTransform, GroupByCol, NestAggCol, ValueTransform};
pub use level::{BoundColumn, LevelLayout, NestLevel};
pub use minipage::{MiniPage, MiniPageMut};
pub use nest::{InputStats, Nest, NestRow};
pub use nest_idx::{AccessMode, NestIdx, NestIdxAccess};
