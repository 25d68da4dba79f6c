//! Fixed-size pages for the paged spaces (old, code, map).
//!
//! Every page is a single `PAGE_SIZE`-byte allocation aligned to `PAGE_SIZE`,
//! so the owning page of any interior address is recovered by masking the low
//! bits ([`Page::from_address`]).  The first [`OBJECT_START_OFFSET`] bytes of
//! a page hold the [`Page`] header: the persistent allocation fields, the
//! collector-owned `mc_*` relocation fields, and the remembered-set bitmap
//! (one bit per object-area word).  Objects occupy the remainder.

use std::alloc::{alloc_zeroed, dealloc, Layout};

/// log2 of the page size.
pub const PAGE_SIZE_BITS: usize = 13;
/// Size of a page in bytes (8 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
/// Byte offset of the object area within a page; the header lives below it.
pub const OBJECT_START_OFFSET: usize = 256;
/// Usable object bytes per page.
pub const OBJECT_AREA_SIZE: usize = PAGE_SIZE - OBJECT_START_OFFSET;

/// log2 of the object alignment.
pub const OBJECT_ALIGNMENT_BITS: usize = 3;
/// All heap objects are aligned to (and sized in multiples of) 8 bytes.
pub const OBJECT_ALIGNMENT: usize = 1 << OBJECT_ALIGNMENT_BITS;

/// Size of a machine word / tagged slot.
pub const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// Round `size` up to the object alignment.
#[inline]
pub const fn align_object_size(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// Bytes in the remembered-set bitmap: one bit per object-area word.
const RSET_BYTES: usize = OBJECT_AREA_SIZE / POINTER_SIZE / 8;

/// The page header, stored in place at the bottom of every page.
///
/// `allocation_top` and `next_page` persist across collections.  The `mc_*`
/// fields are owned by the collector between its prepare and finish phases:
///
/// - `mc_first_forwarded`: address of the forwarded copy of the first live
///   object on this page (source-side bookkeeping written while encoding).
/// - `mc_relocation_top`: end of this page's contribution in the destination
///   layout (destination-side bookkeeping).
/// - `mc_page_index`: ordinal of this page in its space's chain; map-space
///   page indices are embedded in forwarding encodings.
#[repr(C)]
pub struct Page {
    /// Address one past the last allocated byte in this page's object area.
    pub allocation_top: usize,
    /// Next page in the owning space's chain, or null for the last page.
    pub next_page: *mut Page,
    /// Forwarded address of the first live object on this page.
    pub mc_first_forwarded: usize,
    /// End of this page's contribution in the compacted destination layout.
    pub mc_relocation_top: usize,
    /// Ordinal of this page within its space's chain.
    pub mc_page_index: usize,
    /// Remembered set: bit N covers the Nth word of the object area and is
    /// set when that slot holds a pointer into new space.
    rset: [u8; RSET_BYTES],
}

const _: () = assert!(std::mem::size_of::<Page>() <= OBJECT_START_OFFSET);

impl Page {
    /// Allocate and initialise a fresh page.
    ///
    /// # Panics
    /// Panics if the system allocator fails.
    pub fn allocate() -> *mut Page {
        // SAFETY: PAGE_SIZE is non-zero and a power of two, so the layout is
        // valid; alloc_zeroed gives us a cleared header and rset for free.
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("valid page layout");
        let raw = unsafe { alloc_zeroed(layout) };
        assert!(!raw.is_null(), "page allocation failed");
        let page = raw as *mut Page;
        // SAFETY: raw is a fresh, exclusive, zeroed PAGE_SIZE allocation.
        unsafe {
            (*page).allocation_top = (*page).object_area_start();
            (*page).next_page = std::ptr::null_mut();
            (*page).mc_relocation_top = (*page).object_area_start();
        }
        page
    }

    /// Release a page previously returned by [`allocate`][Self::allocate].
    ///
    /// # Safety
    /// `page` must originate from `Page::allocate` and must not be used
    /// afterwards.
    pub unsafe fn deallocate(page: *mut Page) {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("valid page layout");
        // SAFETY: caller guarantees `page` came from `allocate` with this layout.
        unsafe { dealloc(page as *mut u8, layout) };
    }

    /// Recover the owning page of an interior address.
    ///
    /// Valid for addresses inside paged-space pages only; the result is
    /// meaningless for semi-space or large-object addresses.
    #[inline]
    pub fn from_address(addr: usize) -> *mut Page {
        (addr & !(PAGE_SIZE - 1)) as *mut Page
    }

    /// Base address of this page.
    #[inline]
    pub fn address(&self) -> usize {
        self as *const Page as usize
    }

    /// First address of the object area.
    #[inline]
    pub fn object_area_start(&self) -> usize {
        self.address() + OBJECT_START_OFFSET
    }

    /// One past the last address of the object area.
    #[inline]
    pub fn object_area_end(&self) -> usize {
        self.address() + PAGE_SIZE
    }

    /// Byte offset of `addr` from the page base (header included).
    #[inline]
    pub fn offset_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr) || addr == self.object_area_end());
        addr - self.address()
    }

    /// Address at byte offset `offset` from the page base.
    #[inline]
    pub fn address_at_offset(&self, offset: usize) -> usize {
        debug_assert!((OBJECT_START_OFFSET..=PAGE_SIZE).contains(&offset));
        self.address() + offset
    }

    /// Returns `true` if `addr` lies within this page's object area.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        (self.object_area_start()..self.object_area_end()).contains(&addr)
    }

    // ── Remembered set ────────────────────────────────────────────────────

    #[inline]
    fn rset_bit_for(&self, slot_addr: usize) -> (usize, u8) {
        debug_assert!(self.contains(slot_addr));
        debug_assert!(slot_addr % POINTER_SIZE == 0, "rset covers aligned slots");
        let word = (slot_addr - self.object_area_start()) / POINTER_SIZE;
        (word / 8, 1 << (word % 8))
    }

    /// Record that the slot at `slot_addr` holds a new-space pointer.
    pub fn set_rset_bit(&mut self, slot_addr: usize) {
        let (byte, bit) = self.rset_bit_for(slot_addr);
        self.rset[byte] |= bit;
    }

    /// Returns `true` if the slot at `slot_addr` is recorded in the set.
    pub fn is_rset_bit_set(&self, slot_addr: usize) -> bool {
        let (byte, bit) = self.rset_bit_for(slot_addr);
        self.rset[byte] & bit != 0
    }

    /// Clear the remembered-set bits covering `[start, start + size)`.
    pub fn clear_rset_range(&mut self, start: usize, size: usize) {
        let mut addr = start;
        while addr < start + size {
            let (byte, bit) = self.rset_bit_for(addr);
            self.rset[byte] &= !bit;
            addr += POINTER_SIZE;
        }
    }

    /// Clear the whole remembered set of this page.
    pub fn clear_rset(&mut self) {
        self.rset = [0u8; RSET_BYTES];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OwnedPage(*mut Page);
    impl Drop for OwnedPage {
        fn drop(&mut self) {
            // SAFETY: the pointer came from Page::allocate in the test.
            unsafe { Page::deallocate(self.0) };
        }
    }

    #[test]
    fn page_is_aligned_to_its_size() {
        let page = OwnedPage(Page::allocate());
        assert_eq!(page.0 as usize % PAGE_SIZE, 0);
    }

    #[test]
    fn from_address_recovers_the_page_of_an_interior_address() {
        let page = OwnedPage(Page::allocate());
        // SAFETY: page.0 is a live page.
        let start = unsafe { (*page.0).object_area_start() };
        assert_eq!(Page::from_address(start), page.0);
        assert_eq!(Page::from_address(start + 4096), page.0);
    }

    #[test]
    fn fresh_page_allocation_top_is_object_area_start() {
        let page = OwnedPage(Page::allocate());
        // SAFETY: page.0 is a live page.
        unsafe {
            assert_eq!((*page.0).allocation_top, (*page.0).object_area_start());
            assert_eq!((*page.0).mc_relocation_top, (*page.0).object_area_start());
            assert!((*page.0).next_page.is_null());
        }
    }

    #[test]
    fn rset_bit_round_trip() {
        let page = OwnedPage(Page::allocate());
        // SAFETY: page.0 is a live page for the whole test.
        unsafe {
            let slot = (*page.0).object_area_start() + 5 * POINTER_SIZE;
            assert!(!(*page.0).is_rset_bit_set(slot));
            (*page.0).set_rset_bit(slot);
            assert!((*page.0).is_rset_bit_set(slot));
            (*page.0).clear_rset_range(slot, POINTER_SIZE);
            assert!(!(*page.0).is_rset_bit_set(slot));
        }
    }

    #[test]
    fn clear_rset_range_only_touches_the_range() {
        let page = OwnedPage(Page::allocate());
        // SAFETY: page.0 is a live page for the whole test.
        unsafe {
            let base = (*page.0).object_area_start();
            (*page.0).set_rset_bit(base);
            (*page.0).set_rset_bit(base + 8 * POINTER_SIZE);
            (*page.0).clear_rset_range(base, 4 * POINTER_SIZE);
            assert!(!(*page.0).is_rset_bit_set(base));
            assert!((*page.0).is_rset_bit_set(base + 8 * POINTER_SIZE));
        }
    }

    #[test]
    fn align_object_size_rounds_up_to_eight() {
        assert_eq!(align_object_size(1), 8);
        assert_eq!(align_object_size(8), 8);
        assert_eq!(align_object_size(17), 24);
    }
}
