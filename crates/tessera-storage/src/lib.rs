//! Storage layer for Tessera.
//!
//! This crate provides:
//! - Slotted page views shared by B+Tree nodes and nest mini-pages
//! - An in-memory B+Tree index over composite keys with fixed-size values
//! - Records, an in-memory record store and field resolution

pub mod btree;
pub mod page;
mod tuple;

pub use btree::{
    BTreeIndex, BTreeScan, KeyColumn, KeyContext, KeyDatum, KeySchema, KeyStrategy, NodeArena,
    NodeId, PathFrame, ScanDirection, ScanEntry, ScanKey, ScanOp, SlotTable, TrimEnd, Upsert,
    compare_values, key_of, max_item_footprint,
};
pub use page::{SlotFormat, SlottedPage, SlottedPageMut};
pub use tuple::{
    DirectPath, FieldRef, MemRecordStore, Record, RecordId, RecordStore, Schema, SearchPath,
};
