//! Generation-checked slab of B+Tree nodes.
//!
//! Nodes are addressed by `NodeId { index, generation }`. Freed slots go on
//! a free list and bump their generation, so a stale sibling or child link
//! is reported instead of silently reading a recycled node.

use tessera_common::{Result, TesseraError};

/// Handle of a node in a `NodeArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub index: u32,
    pub generation: u32,
}

impl NodeId {
    /// Absent link.
    pub const NONE: NodeId = NodeId {
        index: u32::MAX,
        generation: 0,
    };

    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    #[inline]
    pub fn is_none(&self) -> bool {
        self.index == u32::MAX
    }

    #[inline]
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Serializes to bytes (index then generation, little-endian).
    #[inline]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.index.to_le_bytes());
        buf[4..8].copy_from_slice(&self.generation.to_le_bytes());
        buf
    }

    /// Deserializes from bytes.
    #[inline]
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            index: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            generation: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}@{}", self.index, self.generation)
        }
    }
}

struct Slot {
    generation: u32,
    page: Option<Box<[u8]>>,
}

/// Slab of fixed-size node pages.
pub struct NodeArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    node_size: usize,
    live: usize,
}

impl NodeArena {
    /// Creates an empty arena of `node_size`-byte pages.
    pub fn new(node_size: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            node_size,
            live: 0,
        }
    }

    /// Returns the page size.
    #[inline]
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Number of allocated nodes.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Allocates a zeroed page, reusing a freed slot when one exists.
    pub fn allocate(&mut self) -> NodeId {
        let page = vec![0u8; self.node_size].into_boxed_slice();
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.page = Some(page);
            return NodeId {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            page: Some(page),
        });
        NodeId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Returns the page of a live node.
    #[inline]
    pub fn get(&self, id: NodeId) -> Result<&[u8]> {
        match self.slots.get(id.index as usize) {
            Some(Slot {
                generation,
                page: Some(page),
            }) if *generation == id.generation => Ok(&page[..]),
            _ => Err(TesseraError::StaleNode(id.to_string())),
        }
    }

    /// Returns the mutable page of a live node.
    #[inline]
    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut [u8]> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot {
                generation,
                page: Some(page),
            }) if *generation == id.generation => Ok(&mut page[..]),
            _ => Err(TesseraError::StaleNode(id.to_string())),
        }
    }

    /// Releases a node. Its handle, and every copy of it, becomes stale.
    pub fn free(&mut self, id: NodeId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation && s.page.is_some())
            .ok_or_else(|| TesseraError::StaleNode(id.to_string()))?;
        slot.page = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Ok(())
    }
}
