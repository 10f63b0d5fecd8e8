//! B+Tree node layout constants.

/// Node header size in bytes.
///
/// Layout:
/// - d_upper: 2 bytes
/// - d_lower: 2 bytes
/// - flags: 1 byte
/// - reserved: 1 byte
/// - level: 2 bytes (0 = leaf)
/// - high_key_offset: 2 bytes
/// - high_key_len: 2 bytes
/// - reserved: 4 bytes
/// - left sibling: 8 bytes
/// - right sibling: 8 bytes
pub const NODE_HEADER_SIZE: usize = 32;

/// Size of each directory slot (offset:2 + len:2).
pub const NODE_SLOT_SIZE: usize = 4;

/// Size of the key length prefix at the start of every item.
pub const KEY_LEN_SIZE: usize = 2;

/// Size of a child pointer in internal items.
pub const CHILD_SIZE: usize = 8;

/// Limit on consecutive right-sibling hops during one descent step.
pub(crate) const MAX_MOVE_RIGHT: usize = 64;

/// Deepest tree a descent will walk before reporting corruption.
pub(crate) const MAX_TREE_DEPTH: usize = 32;

/// Bytes of a node available to items and the high key.
#[inline]
pub const fn usable_bytes(node_size: usize) -> usize {
    node_size - NODE_HEADER_SIZE
}

/// Largest footprint (payload + slot) of a single item.
///
/// The same amount is held back in every node for its high key, so a node
/// split never fails to place both halves.
#[inline]
pub const fn max_item_footprint(node_size: usize) -> usize {
    usable_bytes(node_size) / 4
}

/// Bytes of a node available to slotted items.
#[inline]
pub const fn item_capacity(node_size: usize) -> usize {
    usable_bytes(node_size) - max_item_footprint(node_size)
}
