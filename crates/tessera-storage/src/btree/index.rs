//! Slotted-page B+Tree index.
//!
//! Nodes live in a `NodeArena`. Every descent records the internal nodes it
//! passes through as a `Vec<PathFrame>`, which split propagation and empty
//! node removal walk back up instead of following parent pointers.

use super::arena::{NodeArena, NodeId};
use super::constants::{CHILD_SIZE, MAX_MOVE_RIGHT, MAX_TREE_DEPTH, max_item_footprint};
use super::node::{
    self, Node, NodeImage, NodeMut, item_footprint, item_len, make_child_item, make_item,
};
use super::types::{KeyColumn, KeyContext, KeyDatum, KeySchema, KeyStrategy, SlotTable, TrimEnd};
use crate::tuple::RecordStore;
use bytes::Bytes;
use std::cmp::Ordering;
use std::sync::Arc;
use tessera_common::{IndexConfig, Result, TesseraError, Value};
use tracing::{debug, trace};

/// How a descent treats keys equal to the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchMode {
    /// Stop at the first key >= probe.
    Lower,
    /// Stop after the last key <= probe.
    Upper,
}

/// Outcome of checking a key before insertion.
enum Placement {
    New { stored: Bytes, probe: Vec<Value> },
    Existing { leaf: NodeId, pos: usize },
}

/// An internal node visited during descent and the entry that was followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathFrame {
    pub node: NodeId,
    pub slot: usize,
}

/// Value slot returned by `upsert`.
#[derive(Debug)]
pub struct Upsert<'a> {
    /// The leaf value bytes, zeroed when freshly inserted.
    pub value: &'a mut [u8],
    /// True if the key did not exist before.
    pub inserted: bool,
}

fn corrupted(msg: impl Into<String>) -> TesseraError {
    TesseraError::BTreeCorrupted(msg.into())
}

/// Ordered index over composite keys with fixed-size values.
pub struct BTreeIndex {
    config: IndexConfig,
    schema: KeySchema,
    arena: NodeArena,
    root: NodeId,
    /// Number of levels (1 = the root is a leaf).
    depth: usize,
    leaf_count: usize,
    len: usize,
    /// Set by the first insert; columns are fixed from then on.
    frozen: bool,
    store: Option<Arc<dyn RecordStore>>,
    slots: SlotTable,
}

impl BTreeIndex {
    /// Creates an empty index.
    pub fn new(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let mut arena = NodeArena::new(config.node_size);
        let root = arena.allocate();
        NodeImage::leaf().write(arena.get_mut(root)?)?;
        Ok(Self {
            config,
            schema: KeySchema::new(),
            arena,
            root,
            depth: 1,
            leaf_count: 1,
            len: 0,
            frozen: false,
            store: None,
            slots: SlotTable::default(),
        })
    }

    /// Creates an empty index whose reference key columns read from `store`.
    pub fn with_record_store(config: IndexConfig, store: Arc<dyn RecordStore>) -> Result<Self> {
        let mut index = Self::new(config)?;
        index.store = Some(store);
        Ok(index)
    }

    /// Appends a key column. Only allowed before the first insert.
    pub fn add_column(&mut self, column: KeyColumn) -> Result<()> {
        if self.frozen {
            return Err(TesseraError::ColumnsFrozen);
        }
        if self.schema.len() >= self.config.max_key_columns {
            return Err(TesseraError::TooManyColumns {
                max: self.config.max_key_columns,
            });
        }
        if column.strategy != KeyStrategy::ByValue {
            if self.store.is_none() {
                return Err(TesseraError::ConfigError(format!(
                    "column {} needs a record store",
                    column.name
                )));
            }
            if column.field.is_none() {
                return Err(TesseraError::ConfigError(format!(
                    "column {} has no record field",
                    column.name
                )));
            }
        }
        debug!(
            column = %column.name,
            type_id = %column.type_id,
            strategy = ?column.strategy,
            "added key column"
        );
        self.schema.push(column);
        Ok(())
    }

    #[inline]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[inline]
    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of levels, 1 when the root is a leaf.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Number of allocated nodes, leaves included.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.arena.live()
    }

    /// Number of record handles held for `BySlot` columns.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Returns true once columns can no longer change.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub(crate) fn ctx(&self) -> KeyContext<'_> {
        KeyContext {
            store: self.store.as_deref(),
            slots: &self.slots,
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<Node<'_>> {
        Node::open(self.arena.get(id)?)
    }

    fn compare(&self, probe: &[Value], stored: &[u8]) -> Result<Ordering> {
        self.schema.compare(probe, stored, &self.ctx())
    }

    fn write_node(&mut self, id: NodeId, image: &NodeImage) -> Result<()> {
        image.write(self.arena.get_mut(id)?)
    }

    fn set_left(&mut self, id: NodeId, left: NodeId) -> Result<()> {
        NodeMut::open(self.arena.get_mut(id)?)?.set_left(left);
        Ok(())
    }

    fn set_right(&mut self, id: NodeId, right: NodeId) -> Result<()> {
        NodeMut::open(self.arena.get_mut(id)?)?.set_right(right);
        Ok(())
    }

    fn set_high_key(&mut self, id: NodeId, high_key: Option<Bytes>) -> Result<()> {
        let mut image = NodeImage::read(self.arena.get(id)?)?;
        image.high_key = high_key;
        self.write_node(id, &image)
    }

    // =========================================================================
    // Descent
    // =========================================================================

    /// Binary search over the first `count` keys of `node`.
    pub(crate) fn bound_in(
        &self,
        node: &Node<'_>,
        count: usize,
        probe: &[Value],
        mode: SearchMode,
    ) -> Result<usize> {
        let mut low = 0usize;
        let mut high = count;
        while low < high {
            let mid = low + (high - low) / 2;
            let ord = self.compare(probe, node.key(mid))?;
            let go_right = match mode {
                SearchMode::Lower => ord == Ordering::Greater,
                SearchMode::Upper => ord != Ordering::Less,
            };
            if go_right {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }

    fn beyond_high_key(&self, node: &Node<'_>, probe: &[Value], mode: SearchMode) -> Result<bool> {
        if node.right().is_none() {
            return Ok(false);
        }
        let Some(high_key) = node.high_key() else {
            return Ok(false);
        };
        let ord = self.compare(probe, high_key)?;
        Ok(match mode {
            SearchMode::Lower => ord == Ordering::Greater,
            SearchMode::Upper => ord != Ordering::Less,
        })
    }

    fn move_right(&self, mut id: NodeId, probe: &[Value], mode: SearchMode) -> Result<NodeId> {
        for _ in 0..MAX_MOVE_RIGHT {
            let node = self.node(id)?;
            if !self.beyond_high_key(&node, probe, mode)? {
                return Ok(id);
            }
            trace!(from = %id, to = %node.right(), "moved right past high key");
            id = node.right();
        }
        Err(corrupted("too many right moves"))
    }

    /// Descends from the root to the leaf where `probe` belongs.
    pub(crate) fn descend(
        &self,
        probe: &[Value],
        mode: SearchMode,
    ) -> Result<(Vec<PathFrame>, NodeId)> {
        let mut path = Vec::with_capacity(self.depth);
        let mut current = self.root;
        loop {
            current = self.move_right(current, probe, mode)?;
            let node = self.node(current)?;
            if node.is_leaf() {
                return Ok((path, current));
            }
            if node.is_empty() {
                return Err(corrupted(format!("empty internal node {current}")));
            }
            let slot = self.bound_in(&node, node.len() - 1, probe, mode)?;
            path.push(PathFrame {
                node: current,
                slot,
            });
            if path.len() > MAX_TREE_DEPTH {
                return Err(corrupted("descent deeper than any valid tree"));
            }
            current = node.child(slot);
        }
    }

    /// Descends to the left-most or right-most leaf.
    pub(crate) fn descend_edge(&self, end: TrimEnd) -> Result<(Vec<PathFrame>, NodeId)> {
        let mut path = Vec::with_capacity(self.depth);
        let mut current = self.root;
        loop {
            let node = self.node(current)?;
            if node.is_leaf() {
                return Ok((path, current));
            }
            if node.is_empty() {
                return Err(corrupted(format!("empty internal node {current}")));
            }
            let slot = match end {
                TrimEnd::Front => 0,
                TrimEnd::Back => node.len() - 1,
            };
            path.push(PathFrame {
                node: current,
                slot,
            });
            if path.len() > MAX_TREE_DEPTH {
                return Err(corrupted("descent deeper than any valid tree"));
            }
            current = node.child(slot);
        }
    }

    /// Moves `path` from `leaf` to its right sibling and returns the
    /// sibling.
    fn step_right(&self, path: &mut [PathFrame], leaf: NodeId) -> Result<NodeId> {
        let mut level = path.len();
        while level > 0 {
            let frame = path[level - 1];
            if frame.slot + 1 < self.node(frame.node)?.len() {
                break;
            }
            level -= 1;
        }
        if level == 0 {
            return Err(corrupted(format!("no parent entry right of {leaf}")));
        }
        path[level - 1].slot += 1;
        let frame = path[level - 1];
        let mut child = self.node(frame.node)?.child(frame.slot);
        for slot in path.iter_mut().skip(level) {
            *slot = PathFrame {
                node: child,
                slot: 0,
            };
            child = self.node(child)?.child(0);
        }
        if child != self.node(leaf)?.right() {
            return Err(corrupted(format!("sibling link of {leaf} disagrees with parents")));
        }
        Ok(child)
    }

    /// Locates the first entry matching `probe`.
    fn find_entry(&self, probe: &[Value]) -> Result<Option<(Vec<PathFrame>, NodeId, usize)>> {
        let (mut path, mut leaf) = self.descend(probe, SearchMode::Lower)?;
        for _ in 0..MAX_MOVE_RIGHT {
            let node = self.node(leaf)?;
            let pos = self.bound_in(&node, node.len(), probe, SearchMode::Lower)?;
            if pos < node.len() {
                if self.compare(probe, node.key(pos))? == Ordering::Equal {
                    return Ok(Some((path, leaf, pos)));
                }
                return Ok(None);
            }
            if node.right().is_none() {
                return Ok(None);
            }
            // Every key here sorts before the probe; an equal key can only
            // open the right sibling.
            leaf = self.step_right(&mut path, leaf)?;
        }
        Err(corrupted("lookup walked too many siblings"))
    }

    // =========================================================================
    // Point operations
    // =========================================================================

    /// Returns the value of the first entry matching `key`.
    ///
    /// `key` may name only a prefix of the key columns.
    pub fn find(&self, key: &[KeyDatum]) -> Result<Option<&[u8]>> {
        let probe = self.schema.probe(key, &self.ctx())?;
        match self.find_entry(&probe)? {
            Some((_, leaf, pos)) => Ok(Some(self.node(leaf)?.payload(pos))),
            None => Ok(None),
        }
    }

    /// Mutable variant of `find`.
    pub fn find_mut(&mut self, key: &[KeyDatum]) -> Result<Option<&mut [u8]>> {
        let probe = self.schema.probe(key, &self.ctx())?;
        match self.find_entry(&probe)? {
            Some((_, leaf, pos)) => {
                let node = NodeMut::open(self.arena.get_mut(leaf)?)?;
                Ok(Some(node.into_payload_mut(pos)))
            }
            None => Ok(None),
        }
    }

    /// Returns the value of `key`, inserting a zeroed one if it is absent.
    pub fn upsert(&mut self, key: &[KeyDatum]) -> Result<Upsert<'_>> {
        let (leaf, pos, inserted) = self.insert_entry(key, true)?;
        let node = NodeMut::open(self.arena.get_mut(leaf)?)?;
        Ok(Upsert {
            value: node.into_payload_mut(pos),
            inserted,
        })
    }

    /// Inserts `key` with a zeroed value and returns the value.
    ///
    /// Unique indexes reject an existing key with `DuplicateKey`; other
    /// indexes place the new entry after every equal key.
    pub fn insert(&mut self, key: &[KeyDatum]) -> Result<&mut [u8]> {
        let (leaf, pos, _) = self.insert_entry(key, false)?;
        let node = NodeMut::open(self.arena.get_mut(leaf)?)?;
        Ok(node.into_payload_mut(pos))
    }

    fn insert_entry(&mut self, key: &[KeyDatum], upsert: bool) -> Result<(NodeId, usize, bool)> {
        if self.schema.is_empty() {
            return Err(TesseraError::ConfigError("index has no key columns".to_string()));
        }
        // Slots interned for a key that never lands in the tree are released.
        let interned = self.slots.len();
        let (stored, probe) = match self.check_new_key(key, upsert) {
            Ok(Placement::New { stored, probe }) => (stored, probe),
            Ok(Placement::Existing { leaf, pos }) => {
                self.slots.truncate(interned);
                return Ok((leaf, pos, false));
            }
            Err(err) => {
                self.slots.truncate(interned);
                return Err(err);
            }
        };
        self.frozen = true;

        let mode = if self.config.unique {
            SearchMode::Lower
        } else {
            SearchMode::Upper
        };
        let (path, leaf) = self.descend(&probe, mode)?;
        let pos = {
            let node = self.node(leaf)?;
            self.bound_in(&node, node.len(), &probe, mode)?
        };
        let value = vec![0u8; self.config.value_size];
        let placed = NodeMut::open(self.arena.get_mut(leaf)?)?.insert_item(pos, &stored, &value);
        let (leaf, pos) = if placed {
            (leaf, pos)
        } else {
            self.split_leaf(path, leaf, pos, make_item(&stored, &value))?
        };
        self.len += 1;
        Ok((leaf, pos, true))
    }

    /// Encodes `key` and checks it against the size limit and existing
    /// entries, without touching the tree.
    fn check_new_key(&mut self, key: &[KeyDatum], upsert: bool) -> Result<Placement> {
        let stored = self.schema.encode(key, &mut self.slots)?;
        let size = item_footprint(item_len(stored.len(), self.config.value_size))
            .max(item_footprint(item_len(stored.len(), CHILD_SIZE)));
        let max = max_item_footprint(self.config.node_size);
        if size > max {
            return Err(TesseraError::KeyTooLarge { size, max });
        }
        let probe = self.schema.decode(&stored, &self.ctx())?;
        if upsert || self.config.unique {
            if let Some((_, leaf, pos)) = self.find_entry(&probe)? {
                if upsert {
                    return Ok(Placement::Existing { leaf, pos });
                }
                return Err(TesseraError::DuplicateKey);
            }
        }
        Ok(Placement::New { stored, probe })
    }

    /// Splits a full leaf while inserting `item` at `pos`. Returns where the
    /// new item ended up.
    fn split_leaf(
        &mut self,
        path: Vec<PathFrame>,
        leaf: NodeId,
        pos: usize,
        item: Bytes,
    ) -> Result<(NodeId, usize)> {
        let mut image = NodeImage::read(self.arena.get(leaf)?)?;
        image.items.insert(pos, item);
        let split = image.split_point();

        let right_id = self.arena.allocate();
        let mut right = NodeImage::leaf();
        right.items = image.items.split_off(split);
        right.high_key = image.high_key.take();
        right.left = leaf;
        right.right = image.right;

        let separator = Bytes::copy_from_slice(node::item_key(&image.items[split - 1]));
        image.high_key = Some(separator.clone());
        image.right = right_id;

        self.write_node(right_id, &right)?;
        self.write_node(leaf, &image)?;
        if right.right.is_some() {
            self.set_left(right.right, right_id)?;
        }
        self.leaf_count += 1;
        trace!(left = %leaf, right = %right_id, split, "split leaf");

        self.propagate(path, separator, leaf, right_id)?;
        Ok(if pos < split {
            (leaf, pos)
        } else {
            (right_id, pos - split)
        })
    }

    /// Returns the entry of `image` that points at `child`, trusting the
    /// recorded slot when it still matches.
    fn child_slot(&self, image: &NodeImage, frame: PathFrame, child: NodeId) -> Result<usize> {
        if frame.slot < image.items.len() && image.child(frame.slot) == child {
            return Ok(frame.slot);
        }
        image
            .find_child(child)
            .ok_or_else(|| corrupted(format!("{} has no entry for child {}", frame.node, child)))
    }

    /// Pushes `separator` for the split `left | right` into the parents
    /// recorded in `path`, splitting them as needed.
    fn propagate(
        &mut self,
        mut path: Vec<PathFrame>,
        mut separator: Bytes,
        mut left: NodeId,
        mut right: NodeId,
    ) -> Result<()> {
        loop {
            let Some(frame) = path.pop() else {
                return self.grow_root(separator, left, right);
            };
            let mut image = NodeImage::read(self.arena.get(frame.node)?)?;
            let slot = self.child_slot(&image, frame, left)?;
            // The old entry keeps its bound and now routes to `right`.
            let bound = Bytes::copy_from_slice(node::item_key(&image.items[slot]));
            image.items[slot] = make_child_item(&bound, right);
            image.items.insert(slot, make_child_item(&separator, left));
            if image.fits(self.config.node_size) {
                return self.write_node(frame.node, &image);
            }

            let split = image.split_point();
            let sibling = self.arena.allocate();
            let mut upper = NodeImage::internal(image.level);
            upper.items = image.items.split_off(split);
            upper.high_key = image.high_key.take();
            upper.left = frame.node;
            upper.right = image.right;

            let last = image.items.len() - 1;
            let high_key = Bytes::copy_from_slice(node::item_key(&image.items[last]));
            image.items[last] = make_child_item(&[], image.child(last));
            image.high_key = Some(high_key.clone());
            image.right = sibling;

            self.write_node(sibling, &upper)?;
            self.write_node(frame.node, &image)?;
            if upper.right.is_some() {
                self.set_left(upper.right, sibling)?;
            }
            trace!(left = %frame.node, right = %sibling, level = image.level, "split internal node");

            separator = high_key;
            left = frame.node;
            right = sibling;
        }
    }

    fn grow_root(&mut self, separator: Bytes, left: NodeId, right: NodeId) -> Result<()> {
        let level = self.node(left)?.level() + 1;
        let root = self.arena.allocate();
        let mut image = NodeImage::internal(level);
        image.items.push(make_child_item(&separator, left));
        image.items.push(make_child_item(&[], right));
        self.write_node(root, &image)?;
        self.root = root;
        self.depth += 1;
        trace!(root = %root, depth = self.depth, "new root");
        Ok(())
    }

    /// Deletes the first entry matching `key`. Returns false if none did.
    pub fn delete(&mut self, key: &[KeyDatum]) -> Result<bool> {
        let probe = self.schema.probe(key, &self.ctx())?;
        let Some((path, leaf, pos)) = self.find_entry(&probe)? else {
            return Ok(false);
        };
        let mut image = NodeImage::read(self.arena.get(leaf)?)?;
        image.items.remove(pos);
        self.write_node(leaf, &image)?;
        self.len -= 1;
        if image.items.is_empty() && leaf != self.root {
            self.remove_empty(path, leaf)?;
        }
        Ok(true)
    }

    /// Removes `count` entries from one end of the leaf chain.
    ///
    /// Returns false when fewer than `count` entries existed; all of them
    /// are removed and the tree stays consistent.
    pub fn trim(&mut self, count: usize, end: TrimEnd) -> Result<bool> {
        let mut remaining = count;
        while remaining > 0 {
            let (path, leaf) = self.descend_edge(end)?;
            let mut image = NodeImage::read(self.arena.get(leaf)?)?;
            let n = image.items.len();
            if n == 0 {
                trace!(requested = count, missing = remaining, "trim ran out of entries");
                return Ok(false);
            }
            if n <= remaining && leaf != self.root {
                image.items.clear();
                self.write_node(leaf, &image)?;
                self.remove_empty(path, leaf)?;
                self.len -= n;
                remaining -= n;
                continue;
            }
            let take = n.min(remaining);
            match end {
                TrimEnd::Front => {
                    image.items.drain(..take);
                }
                TrimEnd::Back => image.items.truncate(n - take),
            }
            self.write_node(leaf, &image)?;
            self.len -= take;
            remaining -= take;
        }
        Ok(true)
    }

    /// Unlinks the empty node `node` and every ancestor left without
    /// children, then removes the downlink from the first ancestor that
    /// keeps other entries.
    fn remove_empty(&mut self, path: Vec<PathFrame>, node: NodeId) -> Result<()> {
        let mut chain = vec![node];
        let mut level = path.len();
        let parent = loop {
            if level == 0 {
                return self.reset_root(&chain);
            }
            let frame = path[level - 1];
            if self.node(frame.node)?.len() > 1 {
                break frame;
            }
            chain.push(frame.node);
            level -= 1;
        };

        let top = chain[chain.len() - 1];
        let mut image = NodeImage::read(self.arena.get(parent.node)?)?;
        let slot = self.child_slot(&image, parent, top)?;
        let last = image.items.len() - 1;
        // Removing the right-most child hands its key range to the left
        // neighbour, whose bound becomes the parent's high key.
        let moves_left = slot == last;
        image.items.remove(slot);
        if moves_left {
            let child = image.child(last - 1);
            image.items[last - 1] = make_child_item(&[], child);
        }
        self.write_node(parent.node, &image)?;

        for &dead in &chain {
            let (left, right, high_key, is_leaf) = {
                let node = self.node(dead)?;
                (
                    node.left(),
                    node.right(),
                    node.high_key().map(Bytes::copy_from_slice),
                    node.is_leaf(),
                )
            };
            if left.is_some() {
                if moves_left {
                    self.set_high_key(left, high_key)?;
                }
                self.set_right(left, right)?;
            }
            if right.is_some() {
                self.set_left(right, left)?;
            }
            self.arena.free(dead)?;
            if is_leaf {
                self.leaf_count -= 1;
            }
            trace!(node = %dead, "removed empty node");
        }
        self.collapse_root()
    }

    fn reset_root(&mut self, chain: &[NodeId]) -> Result<()> {
        for &dead in chain {
            self.arena.free(dead)?;
        }
        let root = self.arena.allocate();
        NodeImage::leaf().write(self.arena.get_mut(root)?)?;
        self.root = root;
        self.depth = 1;
        self.leaf_count = 1;
        trace!(root = %root, "reset to empty root");
        Ok(())
    }

    fn collapse_root(&mut self) -> Result<()> {
        loop {
            let (is_leaf, len, child) = {
                let node = self.node(self.root)?;
                let child = if node.is_leaf() || node.is_empty() {
                    NodeId::NONE
                } else {
                    node.child(0)
                };
                (node.is_leaf(), node.len(), child)
            };
            if is_leaf || len != 1 {
                return Ok(());
            }
            self.arena.free(self.root)?;
            self.root = child;
            self.depth -= 1;
            trace!(root = %child, depth = self.depth, "collapsed root");
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Walks every level and checks ordering, high keys, sibling links and
    /// the cached counters.
    pub fn check_invariants(&self) -> Result<()> {
        let ctx = self.ctx();
        let strict = self.config.unique;
        let key_order_ok = |a: &[u8], b: &[u8]| -> Result<bool> {
            let ord = self.schema.compare_stored(a, b, &ctx)?;
            Ok(if strict {
                ord == Ordering::Less
            } else {
                ord != Ordering::Greater
            })
        };

        {
            let root = self.node(self.root)?;
            if root.left().is_some() || root.right().is_some() || root.high_key().is_some() {
                return Err(corrupted("root has siblings or a high key"));
            }
            if !root.is_leaf() && root.len() < 2 {
                return Err(corrupted("internal root with fewer than two children"));
            }
        }

        let mut expected: Vec<NodeId> = vec![self.root];
        let mut level = self.depth;
        let mut leaves = 0usize;
        let mut entries = 0usize;
        loop {
            if level == 0 {
                return Err(corrupted("more levels than the recorded depth"));
            }
            level -= 1;
            let mut next = Vec::new();
            let mut prev = NodeId::NONE;
            let mut prev_high: Option<&[u8]> = None;
            let mut current = expected[0];
            let mut visited = 0usize;
            let mut is_leaf_level = false;

            while current.is_some() {
                if visited >= expected.len() || expected[visited] != current {
                    return Err(corrupted(format!("level chain diverges from parents at {current}")));
                }
                visited += 1;
                let node = self.node(current)?;
                if !node.check_layout() {
                    return Err(corrupted(format!("slot directory of {current} is broken")));
                }
                if node.level() as usize != level {
                    return Err(corrupted(format!("{current} sits at the wrong level")));
                }
                if node.left() != prev {
                    return Err(corrupted(format!("left link of {current} is broken")));
                }
                if node.high_key().is_some() != node.right().is_some() {
                    return Err(corrupted(format!("high key of {current} mismatches its right link")));
                }
                if current != self.root && node.is_empty() {
                    return Err(corrupted(format!("non-root node {current} is empty")));
                }
                is_leaf_level = node.is_leaf();

                let keyed = if node.is_leaf() {
                    node.len()
                } else {
                    node.len().saturating_sub(1)
                };
                for i in 1..keyed {
                    if !key_order_ok(node.key(i - 1), node.key(i))? {
                        return Err(corrupted(format!("keys of {current} out of order")));
                    }
                }
                if keyed > 0 {
                    if let Some(high) = prev_high
                        && !key_order_ok(high, node.key(0))?
                    {
                        return Err(corrupted(format!("{current} overlaps its left sibling")));
                    }
                    if let Some(high) = node.high_key()
                        && self.schema.compare_stored(node.key(keyed - 1), high, &ctx)?
                            == Ordering::Greater
                    {
                        return Err(corrupted(format!("{current} holds keys above its high key")));
                    }
                }

                if node.is_leaf() {
                    leaves += 1;
                    entries += node.len();
                } else {
                    let last = node.len() - 1;
                    if !node.key(last).is_empty() {
                        return Err(corrupted(format!("last entry of {current} has a key")));
                    }
                    for i in 0..node.len() {
                        let child = node.child(i);
                        let bound = if i < last {
                            Some(node.key(i))
                        } else {
                            node.high_key()
                        };
                        if self.node(child)?.high_key() != bound {
                            return Err(corrupted(format!(
                                "high key of {child} differs from its bound in {current}"
                            )));
                        }
                        next.push(child);
                    }
                }

                prev_high = node.high_key();
                prev = current;
                current = node.right();
            }

            if visited != expected.len() {
                return Err(corrupted("level chain ends before its parents' children"));
            }
            if is_leaf_level {
                break;
            }
            expected = next;
        }

        if level != 0 {
            return Err(corrupted("leaves above level zero"));
        }
        if leaves != self.leaf_count {
            return Err(corrupted(format!(
                "leaf count {} but {} leaves found",
                self.leaf_count, leaves
            )));
        }
        if entries != self.len {
            return Err(corrupted(format!(
                "length {} but {} entries found",
                self.len, entries
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::types::key_of;
    use tessera_common::TypeId;

    fn int_index(node_size: usize, value_size: usize) -> BTreeIndex {
        let mut index = BTreeIndex::new(IndexConfig {
            node_size,
            value_size,
            ..Default::default()
        })
        .unwrap();
        index
            .add_column(KeyColumn::by_value("k", TypeId::Int32))
            .unwrap();
        index
    }

    fn put(index: &mut BTreeIndex, k: i32) {
        let value = index.insert(&key_of([k])).unwrap();
        value.copy_from_slice(&k.to_le_bytes());
    }

    fn get(index: &BTreeIndex, k: i32) -> Option<i32> {
        index
            .find(&key_of([k]))
            .unwrap()
            .map(|v| i32::from_le_bytes([v[0], v[1], v[2], v[3]]))
    }

    #[test]
    fn test_empty_index() {
        let index = int_index(128, 4);
        assert!(index.is_empty());
        assert_eq!(index.depth(), 1);
        assert_eq!(index.leaf_count(), 1);
        assert_eq!(get(&index, 1), None);
        index.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_find() {
        let mut index = int_index(128, 4);
        for k in [5, 1, 3] {
            put(&mut index, k);
        }
        assert_eq!(index.len(), 3);
        assert_eq!(get(&index, 3), Some(3));
        assert_eq!(get(&index, 4), None);
        index.check_invariants().unwrap();
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut index = int_index(128, 4);
        put(&mut index, 1);
        assert!(matches!(
            index.insert(&key_of([1])),
            Err(TesseraError::DuplicateKey)
        ));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_upsert_existing_and_fresh() {
        let mut index = int_index(128, 4);
        let slot = index.upsert(&key_of([9])).unwrap();
        assert!(slot.inserted);
        assert_eq!(slot.value, &[0, 0, 0, 0]);
        slot.value[0] = 7;

        let slot = index.upsert(&key_of([9])).unwrap();
        assert!(!slot.inserted);
        assert_eq!(slot.value[0], 7);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_find_mut() {
        let mut index = int_index(128, 4);
        put(&mut index, 2);
        index.find_mut(&key_of([2])).unwrap().unwrap()[0] = 42;
        assert_eq!(get(&index, 2), Some(42));
        assert!(index.find_mut(&key_of([3])).unwrap().is_none());
    }

    #[test]
    fn test_splits_grow_depth() {
        let mut index = int_index(128, 4);
        for k in 0..40 {
            put(&mut index, k);
        }
        assert!(index.depth() >= 3);
        assert!(index.leaf_count() > 10);
        index.check_invariants().unwrap();
        for k in 0..40 {
            assert_eq!(get(&index, k), Some(k));
        }
    }

    #[test]
    fn test_delete_shrinks_tree() {
        let mut index = int_index(128, 4);
        for k in 0..40 {
            put(&mut index, k);
        }
        for k in 0..40 {
            assert!(index.delete(&key_of([k])).unwrap());
            index.check_invariants().unwrap();
        }
        assert!(!index.delete(&key_of([0])).unwrap());
        assert!(index.is_empty());
        assert_eq!(index.depth(), 1);
        assert_eq!(index.leaf_count(), 1);
        assert_eq!(index.node_count(), 1);
    }

    #[test]
    fn test_delete_from_right_end() {
        let mut index = int_index(128, 4);
        for k in 0..30 {
            put(&mut index, k);
        }
        for k in (10..30).rev() {
            assert!(index.delete(&key_of([k])).unwrap());
            index.check_invariants().unwrap();
        }
        assert_eq!(index.len(), 10);
        // New keys past the old maximum land on the stripped right edge.
        for k in 30..35 {
            put(&mut index, k);
        }
        index.check_invariants().unwrap();
        assert_eq!(get(&index, 34), Some(34));
    }

    #[test]
    fn test_columns_frozen_after_insert() {
        let mut index = int_index(128, 4);
        put(&mut index, 1);
        assert!(matches!(
            index.add_column(KeyColumn::by_value("x", TypeId::Int32)),
            Err(TesseraError::ColumnsFrozen)
        ));
    }

    #[test]
    fn test_too_many_columns() {
        let mut index = BTreeIndex::new(IndexConfig {
            max_key_columns: 2,
            ..Default::default()
        })
        .unwrap();
        index.add_column(KeyColumn::by_value("a", TypeId::Int32)).unwrap();
        index.add_column(KeyColumn::by_value("b", TypeId::Int32)).unwrap();
        assert!(matches!(
            index.add_column(KeyColumn::by_value("c", TypeId::Int32)),
            Err(TesseraError::TooManyColumns { max: 2 })
        ));
    }

    #[test]
    fn test_reference_column_needs_store() {
        let mut index = BTreeIndex::new(IndexConfig::default()).unwrap();
        let err = index
            .add_column(KeyColumn::by_reference("r", TypeId::Text, 0))
            .unwrap_err();
        assert!(matches!(err, TesseraError::ConfigError(_)));
    }

    #[test]
    fn test_key_too_large() {
        let mut index = BTreeIndex::new(IndexConfig {
            node_size: 128,
            value_size: 4,
            ..Default::default()
        })
        .unwrap();
        index.add_column(KeyColumn::by_value("s", TypeId::Text)).unwrap();
        let err = index.insert(&key_of(["a long key that cannot fit"])).unwrap_err();
        assert!(matches!(err, TesseraError::KeyTooLarge { .. }));
        assert!(err.is_recoverable());
        assert!(index.is_empty());
        index.check_invariants().unwrap();
    }

    #[test]
    fn test_no_columns() {
        let mut index = BTreeIndex::new(IndexConfig::default()).unwrap();
        assert!(matches!(
            index.insert(&[]),
            Err(TesseraError::ConfigError(_))
        ));
    }

    #[test]
    fn test_trim_front_and_back() {
        let mut index = int_index(128, 4);
        for k in 0..30 {
            put(&mut index, k);
        }
        assert!(index.trim(7, TrimEnd::Front).unwrap());
        index.check_invariants().unwrap();
        assert!(index.trim(5, TrimEnd::Back).unwrap());
        index.check_invariants().unwrap();
        assert_eq!(index.len(), 18);
        assert_eq!(get(&index, 6), None);
        assert_eq!(get(&index, 7), Some(7));
        assert_eq!(get(&index, 24), Some(24));
        assert_eq!(get(&index, 25), None);
    }

    #[test]
    fn test_trim_more_than_present() {
        let mut index = int_index(128, 4);
        for k in 0..12 {
            put(&mut index, k);
        }
        assert!(!index.trim(20, TrimEnd::Back).unwrap());
        assert!(index.is_empty());
        index.check_invariants().unwrap();
        put(&mut index, 3);
        assert_eq!(get(&index, 3), Some(3));
    }
}
