//! Mini-page: the slotted format stored inside each nest leaf value.
//!
//! ```text
//! +------------------------------+ 0
//! | d_upper | d_lower | magic | flags | 8
//! +------------------------------+
//! | [level:2 item:2 off:2 len:2] |  <- one entry per accumulator region
//! | ...                          | d_upper
//! +------------------------------+
//! | free                         |
//! +------------------------------+ d_lower
//! | regions, 8-byte aligned      |
//! +------------------------------+ capacity
//! ```
//!
//! Entries are keyed by `(level, item)` and searched linearly; a leaf only
//! holds a few of them. The capacity is fixed by the index value size and a
//! full mini-page never grows. The flags word marks entries whose key is a
//! complete record key rather than a coarser level's NULL-padded key.

use tessera_common::{Result, TesseraError};
use tessera_storage::page::{SlotFormat, SlottedPage, SlottedPageMut, footprint, read_u16, write_u16};

/// Slotted format of mini-pages.
pub struct MiniPageFormat;

impl SlotFormat for MiniPageFormat {
    const HEADER_SIZE: usize = 8;
    const SLOT_SIZE: usize = 8;
    const EXTENT_OFFSET: usize = 4;
}

const MAGIC_OFFSET: usize = 4;
const MAGIC: u16 = 0x4D50;
const FLAGS_OFFSET: usize = 6;
const FLAG_FULL_KEY: u16 = 1;
const LEVEL_OFFSET: usize = 0;
const ITEM_OFFSET: usize = 2;

/// Smallest buffer that can hold a mini-page with one entry.
pub const MIN_MINI_PAGE_SIZE: usize = MiniPageFormat::HEADER_SIZE + MiniPageFormat::SLOT_SIZE + 8;

/// Bytes a region of `size` bytes takes, directory entry included.
pub fn region_footprint(size: usize) -> usize {
    footprint::<MiniPageFormat>(size)
}

fn corrupted(msg: &str) -> TesseraError {
    TesseraError::MiniPageCorrupted(msg.to_string())
}

/// Formats `buf` as an empty mini-page.
pub fn initialize(buf: &mut [u8]) -> Result<()> {
    if buf.len() < MIN_MINI_PAGE_SIZE || buf.len() > u16::MAX as usize {
        return Err(TesseraError::InvalidParameter {
            name: "mini-page size".to_string(),
            value: buf.len().to_string(),
        });
    }
    let mut page = SlottedPageMut::<MiniPageFormat>::init(buf);
    write_u16(page.data_mut(), MAGIC_OFFSET, MAGIC);
    Ok(())
}

fn find(page: &SlottedPage<'_, MiniPageFormat>, level: u16, item: u16) -> Option<usize> {
    (0..page.len()).find(|&i| {
        let slot = page.slot(i);
        read_u16(slot, LEVEL_OFFSET) == level && read_u16(slot, ITEM_OFFSET) == item
    })
}

/// Read-only view of a mini-page.
pub struct MiniPage<'a> {
    page: SlottedPage<'a, MiniPageFormat>,
}

impl<'a> MiniPage<'a> {
    /// Opens a mini-page, validating its header and directory.
    pub fn open(buf: &'a [u8]) -> Result<Self> {
        let page = SlottedPage::open(buf).ok_or_else(|| corrupted("invalid header"))?;
        if read_u16(buf, MAGIC_OFFSET) != MAGIC {
            return Err(corrupted("not initialized"));
        }
        if !page.check_items() {
            return Err(corrupted("entry outside the region area"));
        }
        Ok(Self { page })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.page.len()
    }

    pub fn is_empty(&self) -> bool {
        self.page.is_empty()
    }

    pub fn free_space(&self) -> usize {
        self.page.free_space()
    }

    /// Region of entry `(level, item)`.
    pub fn value(&self, level: u16, item: u16) -> Option<&'a [u8]> {
        find(&self.page, level, item).map(|i| self.page.item(i))
    }

    /// True once some record was grouped under exactly this key.
    pub fn is_full_key(&self) -> bool {
        read_u16(self.page.data(), FLAGS_OFFSET) & FLAG_FULL_KEY != 0
    }

    /// Returns true if `level` owns at least one entry.
    pub fn has_level(&self, level: u16) -> bool {
        (0..self.page.len()).any(|i| read_u16(self.page.slot(i), LEVEL_OFFSET) == level)
    }

    /// Iterates `(level, item, region)` in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (u16, u16, &'a [u8])> + '_ {
        (0..self.page.len()).map(|i| {
            let slot = self.page.slot(i);
            (
                read_u16(slot, LEVEL_OFFSET),
                read_u16(slot, ITEM_OFFSET),
                self.page.item(i),
            )
        })
    }
}

/// Mutable view of a mini-page.
pub struct MiniPageMut<'a> {
    page: SlottedPageMut<'a, MiniPageFormat>,
}

impl<'a> MiniPageMut<'a> {
    /// Opens a mini-page for update, validating its header and directory.
    pub fn open(buf: &'a mut [u8]) -> Result<Self> {
        MiniPage::open(buf)?;
        let page = SlottedPageMut::open(buf).ok_or_else(|| corrupted("invalid header"))?;
        Ok(Self { page })
    }

    /// Borrows a read-only view.
    pub fn view(&self) -> MiniPage<'_> {
        MiniPage {
            page: self.page.view(),
        }
    }

    pub fn free_space(&self) -> usize {
        self.page.free_space()
    }

    pub fn mark_full_key(&mut self) {
        let flags = read_u16(self.page.view().data(), FLAGS_OFFSET);
        write_u16(self.page.data_mut(), FLAGS_OFFSET, flags | FLAG_FULL_KEY);
    }

    /// Adds a zeroed region of `size` bytes for `(level, item)`.
    pub fn add(&mut self, level: u16, item: u16, size: usize) -> Result<&mut [u8]> {
        if find(&self.page.view(), level, item).is_some() {
            return Err(TesseraError::InvalidAccess(format!(
                "mini-page entry ({level}, {item}) already exists"
            )));
        }
        let index = self.page.len();
        if !self.page.insert(index, size) {
            return Err(TesseraError::MiniPageFull {
                requested: region_footprint(size),
                available: self.page.free_space(),
            });
        }
        let slot = self.page.slot_mut(index);
        write_u16(slot, LEVEL_OFFSET, level);
        write_u16(slot, ITEM_OFFSET, item);
        Ok(self.page.item_mut(index))
    }

    pub fn value(&self, level: u16, item: u16) -> Option<&[u8]> {
        let page = self.page.view();
        find(&page, level, item).map(|i| page.item(i))
    }

    pub fn value_mut(&mut self, level: u16, item: u16) -> Option<&mut [u8]> {
        let index = find(&self.page.view(), level, item)?;
        Some(self.page.item_mut(index))
    }

    /// Removes entry `(level, item)` and reclaims its bytes.
    pub fn remove(&mut self, level: u16, item: u16) -> bool {
        let Some(index) = find(&self.page.view(), level, item) else {
            return false;
        };
        self.page.remove(index);
        self.page.compact();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size];
        initialize(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_initialize_and_open() {
        let buf = fresh(64);
        let page = MiniPage::open(&buf).unwrap();
        assert!(page.is_empty());
        assert_eq!(page.free_space(), 56);
    }

    #[test]
    fn test_open_uninitialized() {
        let buf = vec![0u8; 64];
        assert!(matches!(
            MiniPage::open(&buf),
            Err(TesseraError::MiniPageCorrupted(_))
        ));
        let mut buf = vec![0u8; 64];
        assert!(MiniPageMut::open(&mut buf).is_err());
    }

    #[test]
    fn test_add_and_lookup() {
        let mut buf = fresh(128);
        let mut page = MiniPageMut::open(&mut buf).unwrap();
        page.add(0, 0, 8).unwrap().copy_from_slice(&7u64.to_le_bytes());
        page.add(0, 1, 16).unwrap()[0] = 3;
        page.add(1, 0, 4).unwrap();
        assert!(matches!(
            page.add(0, 1, 8),
            Err(TesseraError::InvalidAccess(_))
        ));

        assert_eq!(page.value(0, 0), Some(&7u64.to_le_bytes()[..]));
        assert_eq!(page.value(0, 1).map(|v| v.len()), Some(16));
        assert_eq!(page.value(1, 0).map(|v| v.len()), Some(4));
        assert_eq!(page.value(2, 0), None);
        page.value_mut(0, 1).unwrap()[1] = 9;

        let view = MiniPage::open(&buf).unwrap();
        assert_eq!(view.len(), 3);
        assert!(view.has_level(1));
        assert!(!view.has_level(2));
        assert_eq!(&view.value(0, 1).unwrap()[..2], &[3u8, 9]);
        let keys: Vec<(u16, u16)> = view.entries().map(|(l, i, _)| (l, i)).collect();
        assert_eq!(keys, vec![(0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn test_capacity_limit() {
        // 40 bytes: 8 header + 32 for regions and entries.
        let mut buf = fresh(40);
        let mut page = MiniPageMut::open(&mut buf).unwrap();
        page.add(0, 0, 8).unwrap();
        page.add(0, 1, 8).unwrap();
        let err = page.add(0, 2, 8).unwrap_err();
        assert!(matches!(
            err,
            TesseraError::MiniPageFull {
                requested: 16,
                available: 0
            }
        ));
        assert!(err.is_recoverable());
        assert_eq!(page.value(0, 2), None);
    }

    #[test]
    fn test_remove_reclaims_space() {
        let mut buf = fresh(64);
        let mut page = MiniPageMut::open(&mut buf).unwrap();
        page.add(0, 0, 8).unwrap().fill(1);
        page.add(0, 1, 8).unwrap().fill(2);
        let before = page.free_space();

        assert!(page.remove(0, 0));
        assert!(!page.remove(0, 0));
        assert_eq!(page.free_space(), before + region_footprint(8));
        assert_eq!(page.value(0, 1), Some(&[2u8; 8][..]));
        assert!(page.view().has_level(0));
    }

    #[test]
    fn test_full_key_flag_survives_compaction() {
        let mut buf = fresh(64);
        let mut page = MiniPageMut::open(&mut buf).unwrap();
        assert!(!page.view().is_full_key());
        page.mark_full_key();
        page.add(1, 0, 8).unwrap();
        page.add(1, 1, 8).unwrap();
        assert!(page.remove(1, 0));
        assert!(page.view().is_full_key());
        assert!(MiniPage::open(&buf).unwrap().is_full_key());
    }

    #[test]
    fn test_initialize_bounds() {
        let mut tiny = vec![0u8; 8];
        assert!(initialize(&mut tiny).is_err());
    }
}
