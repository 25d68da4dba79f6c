//! Fixed arrays, byte arrays, and the symbol table view.

use crate::heap::page::{align_object_size, POINTER_SIZE};
use crate::objects::heap_object::HeapObject;
use crate::objects::tagged::TaggedValue;

/// Header bytes of a [`FixedArray`] (map word + length).
pub const FIXED_ARRAY_HEADER_SIZE: usize = 16;

/// A fixed-length array of tagged slots stored inline after the header.
#[repr(C)]
pub struct FixedArray {
    header: HeapObject,
    length: usize,
}

impl FixedArray {
    /// Total object size for an array of `length` tagged slots.
    pub fn size_for(length: usize) -> usize {
        FIXED_ARRAY_HEADER_SIZE + length * POINTER_SIZE
    }

    pub fn size(&self) -> usize {
        Self::size_for(self.length)
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn set_length(&mut self, length: usize) {
        self.length = length;
    }

    /// Address of slot `index`.
    pub fn slot(&self, index: usize) -> *mut TaggedValue {
        debug_assert!(index < self.length);
        (self.header.address() + FIXED_ARRAY_HEADER_SIZE + index * POINTER_SIZE)
            as *mut TaggedValue
    }

    /// Read slot `index`.
    ///
    /// # Safety
    /// The object must be fully initialised and `index` in bounds.
    pub unsafe fn get(&self, index: usize) -> TaggedValue {
        // SAFETY: per this function's contract.
        unsafe { *self.slot(index) }
    }

    /// Write slot `index`.
    ///
    /// # Safety
    /// The object must be fully initialised and `index` in bounds.
    pub unsafe fn set(&mut self, index: usize, value: TaggedValue) {
        // SAFETY: per this function's contract.
        unsafe { *self.slot(index) = value };
    }
}

/// Header bytes of a [`ByteArray`] (map word + length).
pub const BYTE_ARRAY_HEADER_SIZE: usize = 16;

/// A raw byte array.
///
/// Also the filler the sweeper installs over multi-word dead regions so that
/// later heap walks can size them: a byte array of `size - 16` content bytes
/// covers a dead region of `size` bytes exactly.
#[repr(C)]
pub struct ByteArray {
    header: HeapObject,
    length: usize,
}

impl ByteArray {
    pub fn size_for(length: usize) -> usize {
        align_object_size(BYTE_ARRAY_HEADER_SIZE + length)
    }

    /// The content length that makes a byte array occupy exactly
    /// `object_size` bytes.
    pub fn length_for(object_size: usize) -> usize {
        debug_assert!(object_size >= BYTE_ARRAY_HEADER_SIZE);
        debug_assert!(object_size % POINTER_SIZE == 0);
        object_size - BYTE_ARRAY_HEADER_SIZE
    }

    pub fn size(&self) -> usize {
        Self::size_for(self.length)
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn set_length(&mut self, length: usize) {
        self.length = length;
    }
}

/// Number of leading always-live slots in the symbol table.
///
/// Slot 0 holds the live-symbol count as a Smi.  The remaining slots are the
/// element area whose entries are weak: only the symbol-table cleaner decides
/// their fate after marking.
pub const SYMBOL_TABLE_PREFIX_SIZE: usize = 1;

/// A view over the symbol table, which is physically a [`FixedArray`].
///
/// The table object itself is marked as a black root; its element slots are
/// deliberately *not* traced by the marker.
#[repr(transparent)]
pub struct SymbolTable {
    array: FixedArray,
}

impl SymbolTable {
    /// View a fixed array as the symbol table.
    ///
    /// # Safety
    /// `array` must be a live fixed array with at least
    /// `SYMBOL_TABLE_PREFIX_SIZE` slots, slot 0 holding a Smi.
    pub unsafe fn cast(array: *mut FixedArray) -> *mut SymbolTable {
        array as *mut SymbolTable
    }

    /// Slot range of the always-live prefix: `[start, end)`.
    pub fn prefix_slots(&self) -> (*mut TaggedValue, *mut TaggedValue) {
        let start = self.array.slot(0);
        // SAFETY: the prefix is in bounds by the cast contract.
        let end = unsafe { start.add(SYMBOL_TABLE_PREFIX_SIZE) };
        (start, end)
    }

    /// Slot range of the weak element area: `[start, end)`.
    pub fn element_slots(&self) -> (*mut TaggedValue, *mut TaggedValue) {
        let start = self.array.slot(0);
        // SAFETY: slots up to length are in bounds.
        unsafe { (start.add(SYMBOL_TABLE_PREFIX_SIZE), start.add(self.array.length())) }
    }

    /// Number of live symbols recorded in the prefix counter.
    ///
    /// # Safety
    /// The table must be fully initialised.
    pub unsafe fn live_symbols(&self) -> i32 {
        // SAFETY: slot 0 is in bounds and holds a Smi per the cast contract.
        unsafe { self.array.get(0) }.as_smi().unwrap_or(0)
    }

    /// Report `removed` entries overwritten by the cleaner so the counter
    /// stays accurate.
    ///
    /// # Safety
    /// The table must be fully initialised.
    pub unsafe fn elements_removed(&mut self, removed: usize) {
        // SAFETY: slot 0 is in bounds.
        let live = unsafe { self.live_symbols() };
        debug_assert!(live >= removed as i32);
        // SAFETY: slot 0 is in bounds.
        unsafe { self.array.set(0, TaggedValue::from_smi(live - removed as i32)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_array_size_grows_by_slot() {
        assert_eq!(FixedArray::size_for(0), 16);
        assert_eq!(FixedArray::size_for(1), 24);
        assert_eq!(FixedArray::size_for(4), 48);
    }

    #[test]
    fn byte_array_filler_length_covers_region_exactly() {
        for size in [16usize, 24, 48, 4096] {
            let len = ByteArray::length_for(size);
            assert_eq!(ByteArray::size_for(len), size);
        }
    }
}
