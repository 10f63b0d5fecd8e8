//! Page size constants and alignment helpers shared by every slotted format.

/// Default node size in bytes (8 KB).
pub const NODE_SIZE: usize = 8 * 1024;

/// Smallest node size an index accepts.
pub const MIN_NODE_SIZE: usize = 128;

/// Largest node size an index accepts. Offsets inside a page are u16.
pub const MAX_NODE_SIZE: usize = 32 * 1024;

/// Alignment of every payload carved from a page or mini-page.
pub const ALIGNMENT: usize = 8;

/// Rounds `len` up to the next multiple of `ALIGNMENT`.
#[inline]
pub const fn align_up(len: usize) -> usize {
    (len + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Rounds `offset` down to a multiple of `ALIGNMENT`.
#[inline]
pub const fn align_down(offset: usize) -> usize {
    offset & !(ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_size_constants() {
        assert_eq!(NODE_SIZE, 8192);
        assert!(MIN_NODE_SIZE < NODE_SIZE);
        assert!(MAX_NODE_SIZE <= u16::MAX as usize + 1);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(9), 16);
        assert_eq!(align_up(31), 32);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(7), 0);
        assert_eq!(align_down(8), 8);
        assert_eq!(align_down(127), 120);
    }
}
