//! Slotted page builder and view shared by B+Tree nodes and mini-pages.
//!
//! Layout:
//! ```text
//! +-------------------+ 0
//! | d_upper: u16      |
//! | d_lower: u16      |
//! | format header ... | HEADER_SIZE
//! +-------------------+
//! | slot 0            |
//! | slot 1            |
//! | ...               | d_upper
//! +-------------------+
//! | free space        |
//! +-------------------+ d_lower
//! | item n-1          |
//! | ...               |
//! | item 0            |
//! +-------------------+ len (aligned down)
//! ```
//!
//! The slot directory grows down from the header and ends at `d_upper`.
//! Item payloads are carved from the bottom of the buffer, 8-byte aligned,
//! and start at `d_lower`. Free space is always `d_lower - d_upper`.

use std::marker::PhantomData;
use tessera_common::page::{align_down, align_up};

/// Describes the fixed parts of one slotted format.
///
/// Every slot carries the item extent as `(offset: u16, len: u16)` at
/// `EXTENT_OFFSET` within the slot; the remaining slot bytes belong to the
/// format.
pub trait SlotFormat {
    /// Header bytes, including the 4 bytes of `d_upper`/`d_lower`.
    const HEADER_SIZE: usize;
    /// Bytes per directory entry.
    const SLOT_SIZE: usize;
    /// Position of the `(offset, len)` pair inside a slot.
    const EXTENT_OFFSET: usize;
}

const D_UPPER: usize = 0;
const D_LOWER: usize = 2;

/// Reads a little-endian u16 at `off`.
#[inline]
pub fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

/// Writes a little-endian u16 at `off`.
#[inline]
pub fn write_u16(data: &mut [u8], off: usize, value: u16) {
    data[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

/// Bytes consumed by one item of `len` payload bytes, slot included.
#[inline]
pub fn footprint<F: SlotFormat>(len: usize) -> usize {
    align_up(len) + F::SLOT_SIZE
}

fn layout_ok<F: SlotFormat>(data: &[u8]) -> bool {
    if data.len() < F::HEADER_SIZE || data.len() > u16::MAX as usize + 1 {
        return false;
    }
    let upper = read_u16(data, D_UPPER) as usize;
    let lower = read_u16(data, D_LOWER) as usize;
    upper >= F::HEADER_SIZE
        && upper <= lower
        && lower <= data.len()
        && (upper - F::HEADER_SIZE) % F::SLOT_SIZE == 0
}

/// Read-only view of a slotted page.
pub struct SlottedPage<'a, F: SlotFormat> {
    data: &'a [u8],
    _format: PhantomData<F>,
}

impl<'a, F: SlotFormat> SlottedPage<'a, F> {
    /// Opens a view after validating the header.
    pub fn open(data: &'a [u8]) -> Option<Self> {
        layout_ok::<F>(data).then_some(Self {
            data,
            _format: PhantomData,
        })
    }

    /// Returns the raw page bytes.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn d_upper(&self) -> usize {
        read_u16(self.data, D_UPPER) as usize
    }

    #[inline]
    pub fn d_lower(&self) -> usize {
        read_u16(self.data, D_LOWER) as usize
    }

    /// Number of directory entries.
    #[inline]
    pub fn len(&self) -> usize {
        (self.d_upper() - F::HEADER_SIZE) / F::SLOT_SIZE
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes between the directory and the payload area.
    #[inline]
    pub fn free_space(&self) -> usize {
        self.d_lower() - self.d_upper()
    }

    /// Returns true if an item of `len` bytes plus its slot fits.
    #[inline]
    pub fn fits(&self, len: usize) -> bool {
        footprint::<F>(len) <= self.free_space()
    }

    /// Raw bytes of slot `index`.
    #[inline]
    pub fn slot(&self, index: usize) -> &'a [u8] {
        let start = F::HEADER_SIZE + index * F::SLOT_SIZE;
        &self.data[start..start + F::SLOT_SIZE]
    }

    /// Offset and length of item `index`.
    #[inline]
    pub fn extent(&self, index: usize) -> (usize, usize) {
        let slot = self.slot(index);
        (
            read_u16(slot, F::EXTENT_OFFSET) as usize,
            read_u16(slot, F::EXTENT_OFFSET + 2) as usize,
        )
    }

    /// Payload of item `index`.
    #[inline]
    pub fn item(&self, index: usize) -> &'a [u8] {
        let (off, len) = self.extent(index);
        &self.data[off..off + len]
    }

    /// Checks that every item lies inside the payload area and that no
    /// two items share an offset.
    pub fn check_items(&self) -> bool {
        let lower = self.d_lower();
        let mut offsets = Vec::with_capacity(self.len());
        for i in 0..self.len() {
            let (off, len) = self.extent(i);
            if off < lower || off + len > self.data.len() {
                return false;
            }
            offsets.push(off);
        }
        offsets.sort_unstable();
        offsets.windows(2).all(|w| w[0] != w[1])
    }
}

/// Mutable view of a slotted page.
pub struct SlottedPageMut<'a, F: SlotFormat> {
    data: &'a mut [u8],
    _format: PhantomData<F>,
}

impl<'a, F: SlotFormat> SlottedPageMut<'a, F> {
    /// Zeroes `data` and writes an empty directory.
    pub fn init(data: &'a mut [u8]) -> Self {
        data.fill(0);
        let bottom = align_down(data.len()).min(u16::MAX as usize);
        write_u16(data, D_UPPER, F::HEADER_SIZE as u16);
        write_u16(data, D_LOWER, bottom as u16);
        Self {
            data,
            _format: PhantomData,
        }
    }

    /// Opens a mutable view after validating the header.
    pub fn open(data: &'a mut [u8]) -> Option<Self> {
        if !layout_ok::<F>(data) {
            return None;
        }
        Some(Self {
            data,
            _format: PhantomData,
        })
    }

    /// Borrows a read-only view.
    #[inline]
    pub fn view(&self) -> SlottedPage<'_, F> {
        SlottedPage {
            data: &*self.data,
            _format: PhantomData,
        }
    }

    /// Returns the raw page bytes.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.view().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn free_space(&self) -> usize {
        self.view().free_space()
    }

    #[inline]
    pub fn fits(&self, len: usize) -> bool {
        self.view().fits(len)
    }

    /// Mutable slot bytes, for format-specific fields.
    #[inline]
    pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let start = F::HEADER_SIZE + index * F::SLOT_SIZE;
        &mut self.data[start..start + F::SLOT_SIZE]
    }

    /// Mutable payload of item `index`.
    #[inline]
    pub fn item_mut(&mut self, index: usize) -> &mut [u8] {
        let (off, len) = self.view().extent(index);
        &mut self.data[off..off + len]
    }

    /// Consumes the view and returns item `index` for the full page lifetime.
    pub fn into_item_mut(self, index: usize) -> &'a mut [u8] {
        let (off, len) = self.view().extent(index);
        &mut self.data[off..off + len]
    }

    /// Inserts a directory entry at `index` backed by `len` fresh zeroed
    /// payload bytes. Entries at and after `index` shift by one.
    ///
    /// Returns false, leaving the page untouched, when the item does not fit.
    pub fn insert(&mut self, index: usize, len: usize) -> bool {
        let count = self.len();
        if index > count || !self.fits(len) {
            return false;
        }
        let upper = self.view().d_upper();
        let lower = self.view().d_lower() - align_up(len);

        let slot_start = F::HEADER_SIZE + index * F::SLOT_SIZE;
        self.data
            .copy_within(slot_start..upper, slot_start + F::SLOT_SIZE);
        self.data[slot_start..slot_start + F::SLOT_SIZE].fill(0);
        self.data[lower..lower + align_up(len)].fill(0);

        write_u16(self.data, D_UPPER, (upper + F::SLOT_SIZE) as u16);
        write_u16(self.data, D_LOWER, lower as u16);
        let slot = self.slot_mut(index);
        write_u16(slot, F::EXTENT_OFFSET, lower as u16);
        write_u16(slot, F::EXTENT_OFFSET + 2, len as u16);
        true
    }

    /// Carves `len` zeroed bytes from the payload area without a directory
    /// entry and returns their offset. `compact` does not keep them.
    pub fn alloc(&mut self, len: usize) -> Option<usize> {
        let aligned = align_up(len);
        if aligned > self.free_space() {
            return None;
        }
        let lower = self.view().d_lower() - aligned;
        self.data[lower..lower + aligned].fill(0);
        write_u16(self.data, D_LOWER, lower as u16);
        Some(lower)
    }

    /// Appends an item holding a copy of `bytes`.
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        let index = self.len();
        if !self.insert(index, bytes.len()) {
            return false;
        }
        self.item_mut(index).copy_from_slice(bytes);
        true
    }

    /// Removes directory entry `index`. The payload bytes stay behind until
    /// the next `compact`.
    pub fn remove(&mut self, index: usize) {
        let upper = self.view().d_upper();
        let slot_start = F::HEADER_SIZE + index * F::SLOT_SIZE;
        self.data
            .copy_within(slot_start + F::SLOT_SIZE..upper, slot_start);
        let new_upper = upper - F::SLOT_SIZE;
        self.data[new_upper..upper].fill(0);
        write_u16(self.data, D_UPPER, new_upper as u16);
    }

    /// Rewrites the payload area so items are packed against the bottom of
    /// the page, reclaiming the holes left by `remove`. Slot order and the
    /// format-specific slot bytes are preserved.
    pub fn compact(&mut self) {
        let count = self.len();
        let items: Vec<Vec<u8>> = (0..count).map(|i| self.view().item(i).to_vec()).collect();
        let upper = self.view().d_upper();
        let mut lower = align_down(self.data.len()).min(u16::MAX as usize);
        for (i, item) in items.iter().enumerate() {
            lower -= align_up(item.len());
            self.data[lower..lower + item.len()].copy_from_slice(item);
            let slot = self.slot_mut(i);
            write_u16(slot, F::EXTENT_OFFSET, lower as u16);
        }
        self.data[upper..lower].fill(0);
        write_u16(self.data, D_LOWER, lower as u16);
    }

    /// Drops every entry but keeps the format header bytes.
    pub fn clear(&mut self) {
        let bottom = align_down(self.data.len()).min(u16::MAX as usize);
        self.data[F::HEADER_SIZE..].fill(0);
        write_u16(self.data, D_UPPER, F::HEADER_SIZE as u16);
        write_u16(self.data, D_LOWER, bottom as u16);
    }
}
