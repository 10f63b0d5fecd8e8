//! B+Tree node format.
//!
//! Node layout:
//! ```text
//! +------------------------+ 0
//! | Node header (32 bytes) |
//! +------------------------+ 32
//! | Slot array             |
//! | [offset:2, len:2] * n  |  <- grows forward, ends at d_upper
//! +------------------------+
//! |      Free space        |
//! +------------------------+ d_lower
//! | Items                  |  <- carved backward from the end
//! | High key               |
//! +------------------------+ node_size
//! ```
//!
//! Every item is `[key_len:2][key][pad to 8][payload]`. Leaf payloads are
//! the fixed-size value blob; internal payloads are the child `NodeId`.
//!
//! Internal entry `i` routes keys in `(key[i-1], key[i]]` to its child. The
//! last entry has an empty key: its bound is the node's high key, stored
//! once in the header-referenced area and absent on the right-most node of
//! a level.

use super::arena::NodeId;
use super::constants::{
    CHILD_SIZE, KEY_LEN_SIZE, NODE_HEADER_SIZE, NODE_SLOT_SIZE, item_capacity, usable_bytes,
};
use crate::page::{SlotFormat, SlottedPage, SlottedPageMut, footprint, read_u16, write_u16};
use bytes::{BufMut, Bytes, BytesMut};
use tessera_common::page::align_up;
use tessera_common::{Result, TesseraError};

/// Slotted format of B+Tree nodes.
pub struct NodeFormat;

impl SlotFormat for NodeFormat {
    const HEADER_SIZE: usize = NODE_HEADER_SIZE;
    const SLOT_SIZE: usize = NODE_SLOT_SIZE;
    const EXTENT_OFFSET: usize = 0;
}

const FLAGS_OFFSET: usize = 4;
const LEVEL_OFFSET: usize = 6;
const HIGH_KEY_OFFSET: usize = 8;
const HIGH_KEY_LEN: usize = 10;
const LEFT_OFFSET: usize = 16;
const RIGHT_OFFSET: usize = 24;

/// Flags stored in the node header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags(pub u8);

impl NodeFlags {
    /// Node is a leaf.
    pub const LEAF: u8 = 0x01;
    /// Node carries a high key.
    pub const HAS_HIGH_KEY: u8 = 0x02;

    pub fn is_leaf(&self) -> bool {
        self.0 & Self::LEAF != 0
    }

    pub fn set_leaf(&mut self, leaf: bool) {
        if leaf {
            self.0 |= Self::LEAF;
        } else {
            self.0 &= !Self::LEAF;
        }
    }

    pub fn has_high_key(&self) -> bool {
        self.0 & Self::HAS_HIGH_KEY != 0
    }

    pub fn set_has_high_key(&mut self, has: bool) {
        if has {
            self.0 |= Self::HAS_HIGH_KEY;
        } else {
            self.0 &= !Self::HAS_HIGH_KEY;
        }
    }
}

/// Byte length of an item holding `key_len` key bytes and `payload_len`
/// payload bytes.
#[inline]
pub fn item_len(key_len: usize, payload_len: usize) -> usize {
    align_up(KEY_LEN_SIZE + key_len) + payload_len
}

/// Key bytes of a raw item.
#[inline]
pub fn item_key(item: &[u8]) -> &[u8] {
    let key_len = read_u16(item, 0) as usize;
    &item[KEY_LEN_SIZE..KEY_LEN_SIZE + key_len]
}

/// Payload bytes of a raw item.
#[inline]
pub fn item_payload(item: &[u8]) -> &[u8] {
    let key_len = read_u16(item, 0) as usize;
    &item[align_up(KEY_LEN_SIZE + key_len)..]
}

/// Builds a raw item.
pub fn make_item(key: &[u8], payload: &[u8]) -> Bytes {
    let head = align_up(KEY_LEN_SIZE + key.len());
    let mut buf = BytesMut::with_capacity(head + payload.len());
    buf.put_u16_le(key.len() as u16);
    buf.put_slice(key);
    buf.resize(head, 0);
    buf.put_slice(payload);
    buf.freeze()
}

/// Builds an internal item pointing at `child`.
pub fn make_child_item(key: &[u8], child: NodeId) -> Bytes {
    make_item(key, &child.to_bytes())
}

/// Footprint of an item of `len` bytes in a node, slot included.
#[inline]
pub fn item_footprint(len: usize) -> usize {
    footprint::<NodeFormat>(len)
}

fn read_node_id(data: &[u8], off: usize) -> NodeId {
    NodeId::from_bytes(&data[off..off + NodeId::SIZE])
}

/// Read-only view of a node page.
pub struct Node<'a> {
    page: SlottedPage<'a, NodeFormat>,
}

impl<'a> Node<'a> {
    /// Opens a node, validating the page header.
    pub fn open(data: &'a [u8]) -> Result<Self> {
        SlottedPage::open(data)
            .map(|page| Self { page })
            .ok_or_else(|| TesseraError::BTreeCorrupted("invalid node header".to_string()))
    }

    #[inline]
    pub fn flags(&self) -> NodeFlags {
        NodeFlags(self.page.data()[FLAGS_OFFSET])
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.flags().is_leaf()
    }

    /// Height above the leaves (0 = leaf).
    #[inline]
    pub fn level(&self) -> u16 {
        read_u16(self.page.data(), LEVEL_OFFSET)
    }

    #[inline]
    pub fn left(&self) -> NodeId {
        read_node_id(self.page.data(), LEFT_OFFSET)
    }

    #[inline]
    pub fn right(&self) -> NodeId {
        read_node_id(self.page.data(), RIGHT_OFFSET)
    }

    /// Inclusive upper bound of this node's key range.
    pub fn high_key(&self) -> Option<&'a [u8]> {
        if !self.flags().has_high_key() {
            return None;
        }
        let data = self.page.data();
        let off = read_u16(data, HIGH_KEY_OFFSET) as usize;
        let len = read_u16(data, HIGH_KEY_LEN) as usize;
        Some(&data[off..off + len])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.page.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.page.is_empty()
    }

    /// Raw item `index`.
    #[inline]
    pub fn item(&self, index: usize) -> &'a [u8] {
        self.page.item(index)
    }

    #[inline]
    pub fn key(&self, index: usize) -> &'a [u8] {
        item_key(self.item(index))
    }

    #[inline]
    pub fn payload(&self, index: usize) -> &'a [u8] {
        item_payload(self.item(index))
    }

    /// Child pointer of internal entry `index`.
    #[inline]
    pub fn child(&self, index: usize) -> NodeId {
        NodeId::from_bytes(self.payload(index))
    }

    /// Bytes taken by slotted items, slots included.
    pub fn items_used(&self) -> usize {
        let data = self.page.data();
        let hk = self.high_key().map_or(0, |k| align_up(k.len()));
        let bottom = tessera_common::page::align_down(data.len());
        (self.page.d_upper() - NODE_HEADER_SIZE) + (bottom - self.page.d_lower()) - hk
    }

    /// Returns true if an item of `len` bytes can be added without
    /// eating into the room held back for the high key.
    pub fn fits_item(&self, len: usize) -> bool {
        self.items_used() + item_footprint(len) <= item_capacity(self.page.data().len())
    }

    /// Checks the slot directory against the payload area.
    pub fn check_layout(&self) -> bool {
        self.page.check_items()
    }
}

/// Mutable view of a node page.
pub struct NodeMut<'a> {
    page: SlottedPageMut<'a, NodeFormat>,
}

impl<'a> NodeMut<'a> {
    /// Opens a node for update, validating the page header.
    pub fn open(data: &'a mut [u8]) -> Result<Self> {
        SlottedPageMut::open(data)
            .map(|page| Self { page })
            .ok_or_else(|| TesseraError::BTreeCorrupted("invalid node header".to_string()))
    }

    /// Borrows a read-only view.
    pub fn view(&self) -> Node<'_> {
        Node {
            page: self.page.view(),
        }
    }

    pub fn set_left(&mut self, id: NodeId) {
        self.page.data_mut()[LEFT_OFFSET..LEFT_OFFSET + NodeId::SIZE]
            .copy_from_slice(&id.to_bytes());
    }

    pub fn set_right(&mut self, id: NodeId) {
        self.page.data_mut()[RIGHT_OFFSET..RIGHT_OFFSET + NodeId::SIZE]
            .copy_from_slice(&id.to_bytes());
    }

    /// Inserts an item at `index` in place. Returns false if the node has
    /// no room for it.
    pub fn insert_item(&mut self, index: usize, key: &[u8], payload: &[u8]) -> bool {
        let len = item_len(key.len(), payload.len());
        if !self.view().fits_item(len) || !self.page.insert(index, len) {
            return false;
        }
        let item = make_item(key, payload);
        self.page.item_mut(index).copy_from_slice(&item);
        true
    }

    /// Mutable payload of item `index`.
    pub fn payload_mut(&mut self, index: usize) -> &mut [u8] {
        let item = self.page.item_mut(index);
        let head = align_up(KEY_LEN_SIZE + read_u16(item, 0) as usize);
        &mut item[head..]
    }

    /// Consumes the view and returns the payload of item `index`.
    pub fn into_payload_mut(self, index: usize) -> &'a mut [u8] {
        let item = self.page.into_item_mut(index);
        let head = align_up(KEY_LEN_SIZE + read_u16(item, 0) as usize);
        &mut item[head..]
    }
}

/// Owned copy of a node, used to rebuild pages on split and delete.
#[derive(Debug, Clone)]
pub struct NodeImage {
    pub flags: NodeFlags,
    pub level: u16,
    pub left: NodeId,
    pub right: NodeId,
    pub high_key: Option<Bytes>,
    pub items: Vec<Bytes>,
}

impl NodeImage {
    /// An empty leaf with no siblings.
    pub fn leaf() -> Self {
        let mut flags = NodeFlags::default();
        flags.set_leaf(true);
        Self {
            flags,
            level: 0,
            left: NodeId::NONE,
            right: NodeId::NONE,
            high_key: None,
            items: Vec::new(),
        }
    }

    /// An empty internal node at `level`.
    pub fn internal(level: u16) -> Self {
        Self {
            flags: NodeFlags::default(),
            level,
            left: NodeId::NONE,
            right: NodeId::NONE,
            high_key: None,
            items: Vec::new(),
        }
    }

    /// Copies a node page.
    pub fn read(data: &[u8]) -> Result<Self> {
        let node = Node::open(data)?;
        Ok(Self {
            flags: node.flags(),
            level: node.level(),
            left: node.left(),
            right: node.right(),
            high_key: node.high_key().map(Bytes::copy_from_slice),
            items: (0..node.len())
                .map(|i| Bytes::copy_from_slice(node.item(i)))
                .collect(),
        })
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.flags.is_leaf()
    }

    /// Bytes the items take in a page, slots included.
    pub fn items_size(&self) -> usize {
        self.items.iter().map(|i| item_footprint(i.len())).sum()
    }

    /// Returns true if the items stay within the item budget of a node of
    /// `node_size` bytes.
    pub fn fits(&self, node_size: usize) -> bool {
        self.items_size() <= item_capacity(node_size)
    }

    /// Child pointer of internal entry `index`.
    pub fn child(&self, index: usize) -> NodeId {
        NodeId::from_bytes(item_payload(&self.items[index]))
    }

    /// Returns the index of the entry pointing at `child`.
    pub fn find_child(&self, child: NodeId) -> Option<usize> {
        (0..self.items.len()).find(|&i| self.child(i) == child)
    }

    /// Picks the byte-balanced split point: the largest prefix that takes
    /// at most half of the item bytes, keeping both halves non-empty.
    pub fn split_point(&self) -> usize {
        let total = self.items_size();
        let mut used = 0;
        let mut split = 0;
        for item in &self.items {
            let next = used + item_footprint(item.len());
            if next > total / 2 {
                break;
            }
            used = next;
            split += 1;
        }
        split.clamp(1, self.items.len().saturating_sub(1).max(1))
    }

    /// Writes the node into `data`, replacing its previous content.
    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        let hk_size = self.high_key.as_ref().map_or(0, |k| align_up(k.len()));
        if self.items_size() + hk_size > usable_bytes(data.len()) {
            return Err(TesseraError::NodeFull);
        }

        let mut page = SlottedPageMut::<NodeFormat>::init(data);
        let mut flags = self.flags;
        flags.set_has_high_key(self.high_key.is_some());
        {
            let raw = page.data_mut();
            raw[FLAGS_OFFSET] = flags.0;
            write_u16(raw, LEVEL_OFFSET, self.level);
            raw[LEFT_OFFSET..LEFT_OFFSET + NodeId::SIZE].copy_from_slice(&self.left.to_bytes());
            raw[RIGHT_OFFSET..RIGHT_OFFSET + NodeId::SIZE]
                .copy_from_slice(&self.right.to_bytes());
        }
        if let Some(high_key) = &self.high_key {
            let off = page.alloc(high_key.len()).ok_or(TesseraError::NodeFull)?;
            let raw = page.data_mut();
            raw[off..off + high_key.len()].copy_from_slice(high_key);
            write_u16(raw, HIGH_KEY_OFFSET, off as u16);
            write_u16(raw, HIGH_KEY_LEN, high_key.len() as u16);
        }
        for item in &self.items {
            if !page.push(item) {
                return Err(TesseraError::NodeFull);
            }
        }
        Ok(())
    }
}

// Internal payloads are exactly one child handle.
const _: () = assert!(CHILD_SIZE == NodeId::SIZE);
