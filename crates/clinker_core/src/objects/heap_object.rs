//! The [`HeapObject`] base type shared by all GC-managed objects, and the
//! [`MapWord`] that overloads its first word.

use crate::heap::page::{Page, OBJECT_ALIGNMENT_BITS, OBJECT_START_OFFSET, PAGE_SIZE};
use crate::objects::map::Map;

/// The first word of every heap object.
///
/// A map word is in one of two states:
///
/// 1. **Normal**: the address of the object's [`Map`], with the collector's
///    mark bit (bit 0) and overflow bit (bit 1) folded into the low bits that
///    are always zero for an 8-byte-aligned map address.
/// 2. **Encoded forwarding reference** (compacting collections only): the
///    whole word is replaced by a packed `(map location, forwarding offset)`
///    triple and the original map address is destroyed.
///
/// # Forwarding encoding
///
/// ```text
///  31             21 20              10 9               0
/// +-----------------+------------------+-----------------+
/// |forwarding offset|page offset of map|page index of map|
/// +-----------------+------------------+-----------------+
///  11 bits           11 bits            10 bits
/// ```
///
/// Offsets are stored in 8-byte units.  The forwarding offset is the object's
/// distance, in *live bytes*, from the first live object of its source page;
/// resolving it additionally needs the source page's `mc_first_forwarded` and
/// the destination page's `mc_relocation_top`.
///
/// A valid map page offset is at least `OBJECT_START_OFFSET`, so the packed
/// word of any real forwarding reference has a non-zero map-offset field.
/// The free-region sentinels (0 and 1) therefore never collide with an
/// encoded forwarding word.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MapWord(pub usize);

impl MapWord {
    /// Mark bit: set on every reachable object during a collection.
    pub const MARK_BIT: usize = 1 << 0;
    /// Overflow bit: re-queues a gray object when the marking stack is full.
    pub const OVERFLOW_BIT: usize = 1 << 1;
    const FLAG_MASK: usize = Self::MARK_BIT | Self::OVERFLOW_BIT;

    const MAP_PAGE_INDEX_BITS: u32 = 10;
    const MAP_PAGE_OFFSET_BITS: u32 = 11;
    const FORWARDING_OFFSET_BITS: u32 = 11;

    const MAP_PAGE_OFFSET_SHIFT: u32 = Self::MAP_PAGE_INDEX_BITS;
    const FORWARDING_OFFSET_SHIFT: u32 = Self::MAP_PAGE_INDEX_BITS + Self::MAP_PAGE_OFFSET_BITS;

    const MAP_PAGE_INDEX_MASK: usize = (1 << Self::MAP_PAGE_INDEX_BITS) - 1;
    const MAP_PAGE_OFFSET_MASK: usize = (1 << Self::MAP_PAGE_OFFSET_BITS) - 1;
    const FORWARDING_OFFSET_MASK: usize = (1 << Self::FORWARDING_OFFSET_BITS) - 1;

    /// Largest number of map-space pages addressable by an encoding.
    pub const MAX_MAP_PAGES: usize = 1 << Self::MAP_PAGE_INDEX_BITS;

    /// A normal map word referencing `map`, with both flag bits clear.
    #[inline]
    pub fn from_map(map: *mut Map) -> Self {
        debug_assert!(map as usize & Self::FLAG_MASK == 0);
        MapWord(map as usize)
    }

    /// The map address of a normal map word, masking off the flag bits.
    ///
    /// Must not be called on an encoded forwarding word.
    #[inline]
    pub fn to_map(self) -> *mut Map {
        (self.0 & !Self::FLAG_MASK) as *mut Map
    }

    #[inline]
    pub fn is_marked(self) -> bool {
        self.0 & Self::MARK_BIT != 0
    }

    #[inline]
    pub fn is_overflowed(self) -> bool {
        self.0 & Self::OVERFLOW_BIT != 0
    }

    /// Pack a forwarding reference from the map's (current or destination)
    /// address and the object's live-byte offset within its source page.
    ///
    /// # Safety
    /// `map_addr` must lie in the object area of a map-space page whose
    /// `mc_page_index` has been assigned for the current collection.
    pub unsafe fn encode_forwarding(map_addr: usize, offset: usize) -> MapWord {
        let page = Page::from_address(map_addr);
        // SAFETY: caller guarantees map_addr is inside a live map-space page.
        let page_index = unsafe { (*page).mc_page_index };
        let map_offset = map_addr & (PAGE_SIZE - 1);
        debug_assert!(map_offset >= OBJECT_START_OFFSET);
        debug_assert!(map_offset & ((1 << OBJECT_ALIGNMENT_BITS) - 1) == 0);
        debug_assert!(offset & ((1 << OBJECT_ALIGNMENT_BITS) - 1) == 0);

        let page_index_field = page_index & Self::MAP_PAGE_INDEX_MASK;
        let map_offset_field = (map_offset >> OBJECT_ALIGNMENT_BITS) & Self::MAP_PAGE_OFFSET_MASK;
        let forwarding_field = (offset >> OBJECT_ALIGNMENT_BITS) & Self::FORWARDING_OFFSET_MASK;
        debug_assert!(page_index <= Self::MAP_PAGE_INDEX_MASK);
        debug_assert!(map_offset >> OBJECT_ALIGNMENT_BITS <= Self::MAP_PAGE_OFFSET_MASK);
        debug_assert!(offset >> OBJECT_ALIGNMENT_BITS <= Self::FORWARDING_OFFSET_MASK);

        MapWord(
            (forwarding_field << Self::FORWARDING_OFFSET_SHIFT)
                | (map_offset_field << Self::MAP_PAGE_OFFSET_SHIFT)
                | page_index_field,
        )
    }

    /// Map-space page index of an encoded forwarding word.
    #[inline]
    pub fn decode_map_page_index(self) -> usize {
        self.0 & Self::MAP_PAGE_INDEX_MASK
    }

    /// Byte offset of the map within its page, from an encoded word.
    #[inline]
    pub fn decode_map_page_offset(self) -> usize {
        ((self.0 >> Self::MAP_PAGE_OFFSET_SHIFT) & Self::MAP_PAGE_OFFSET_MASK)
            << OBJECT_ALIGNMENT_BITS
    }

    /// Live-byte offset of the object within its source page, from an
    /// encoded word.
    #[inline]
    pub fn decode_offset(self) -> usize {
        ((self.0 >> Self::FORWARDING_OFFSET_SHIFT) & Self::FORWARDING_OFFSET_MASK)
            << OBJECT_ALIGNMENT_BITS
    }
}

/// The base header for every GC-managed heap object.
///
/// # Memory layout
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
///      0     8  map_word
/// ```
///
/// Derived types embed `HeapObject` as their first `#[repr(C)]` field so a
/// `*mut Derived` casts to `*mut HeapObject` and back.  All map accesses must
/// go through [`map`][Self::map] (which masks the collector's flag bits)
/// rather than reading `map_word` directly; during a compacting collection
/// the word may instead hold an encoded forwarding reference, in which case
/// only the decoding helpers are meaningful.
#[repr(C)]
pub struct HeapObject {
    map_word: MapWord,
}

impl HeapObject {
    /// A header with a zero map word.
    ///
    /// Used for detached test values and freshly allocated storage before the
    /// allocator writes the real map.
    pub fn new_null() -> HeapObject {
        HeapObject {
            map_word: MapWord(0),
        }
    }

    /// Address of this object (the address of its map word).
    #[inline]
    pub fn address(&self) -> usize {
        self as *const HeapObject as usize
    }

    /// Reinterpret `addr` as a heap-object pointer.
    #[inline]
    pub fn from_address(addr: usize) -> *mut HeapObject {
        addr as *mut HeapObject
    }

    #[inline]
    pub fn map_word(&self) -> MapWord {
        self.map_word
    }

    #[inline]
    pub fn set_map_word(&mut self, word: MapWord) {
        self.map_word = word;
    }

    /// This object's map, with the collector's flag bits masked off.
    ///
    /// # Safety
    /// The map word must be in its normal state (not an encoded forwarding
    /// reference) and the referenced map must be live.
    #[inline]
    pub unsafe fn map(&self) -> *mut Map {
        self.map_word.to_map()
    }

    /// Install `map`, clearing any flag bits.
    #[inline]
    pub fn set_map(&mut self, map: *mut Map) {
        self.map_word = MapWord::from_map(map);
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.map_word.is_marked()
    }

    #[inline]
    pub fn set_mark(&mut self) {
        self.map_word.0 |= MapWord::MARK_BIT;
    }

    #[inline]
    pub fn clear_mark(&mut self) {
        self.map_word.0 &= !MapWord::MARK_BIT;
    }

    #[inline]
    pub fn is_overflowed(&self) -> bool {
        self.map_word.is_overflowed()
    }

    #[inline]
    pub fn set_overflow(&mut self) {
        self.map_word.0 |= MapWord::OVERFLOW_BIT;
    }

    #[inline]
    pub fn clear_overflow(&mut self) {
        self.map_word.0 &= !MapWord::OVERFLOW_BIT;
    }

    /// Size of this object in bytes, computed from its map.
    ///
    /// # Safety
    /// The map word must be in its normal state and the map must be live.
    pub unsafe fn size(&self) -> usize {
        // SAFETY: per this function's contract.
        unsafe { crate::objects::object_size(self.address() as *mut HeapObject, self.map()) }
    }
}
