//! Paged spaces (old, code, map): page chains with linear bump allocation,
//! a free list fed by the sweeper, and the relocation arena the collector
//! allocates destinations from while compacting.

use crate::error::{HeapError, HeapResult};
use crate::heap::page::{Page, OBJECT_AREA_SIZE, PAGE_SIZE, POINTER_SIZE};
use crate::objects::array::ByteArray;
use crate::objects::heap_object::HeapObject;
use crate::objects::map::{Map, MAP_SIZE};

/// Free blocks smaller than this cannot hold a free-list filler worth
/// reusing and are accounted as waste instead.
const MIN_FREE_BLOCK_SIZE: usize = 2 * POINTER_SIZE;

/// Free-space accounting for a paged space.
///
/// The blocks themselves carry filler objects (installed by the space before
/// registration) so heap walks can size them; the list only tracks addresses.
pub struct FreeList {
    blocks: Vec<(usize, usize)>,
    available: usize,
    waste: usize,
}

impl FreeList {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            available: 0,
            waste: 0,
        }
    }

    /// Register a freed block of `size` bytes at `addr`.
    fn free(&mut self, addr: usize, size: usize) {
        if size < MIN_FREE_BLOCK_SIZE {
            self.waste += size;
        } else {
            self.blocks.push((addr, size));
            self.available += size;
        }
    }

    /// Remove and return the first block of at least `size` bytes.
    fn take_block(&mut self, size: usize) -> Option<(usize, usize)> {
        let index = self.blocks.iter().position(|&(_, bsize)| bsize >= size)?;
        let block = self.blocks.swap_remove(index);
        self.available -= block.1;
        Some(block)
    }

    /// Account bytes stranded at a page end when linear allocation moves on.
    fn add_waste(&mut self, size: usize) {
        self.waste += size;
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub fn waste(&self) -> usize {
        self.waste
    }

    fn clear(&mut self) {
        self.blocks.clear();
        self.available = 0;
        self.waste = 0;
    }
}

/// Maps for the fillers installed over freed blocks.
#[derive(Copy, Clone)]
struct FillerMaps {
    one_word: *mut Map,
    byte_array: *mut Map,
}

/// A paged space: a chain of fixed-size pages with linear allocation.
///
/// During a compacting collection the space doubles as its own relocation
/// destination: [`mc_allocate_raw`][Self::mc_allocate_raw] hands out
/// addresses from the low end of the existing page chain, and
/// [`mc_commit_relocation_info`][Self::mc_commit_relocation_info] makes that
/// layout the live one.
pub struct PagedSpace {
    name: &'static str,
    pages: Vec<*mut Page>,
    max_pages: usize,
    /// Index of the page that `allocation_top` points into.
    current_page: usize,
    /// Linear allocation cursor; 0 while the space has no pages.
    allocation_top: usize,
    free_list: FreeList,
    filler_maps: Option<FillerMaps>,
    // Relocation arena state, valid between mc_reset_relocation_info and
    // mc_commit_relocation_info.
    mc_page: usize,
    mc_top: usize,
    /// Highest destination space-offset seen while relocating into this
    /// space; checked against the encoder's tops at commit time.
    mc_relocated_end_offset: usize,
}

// SAFETY: the space exclusively owns its pages; nothing is shared across
// threads.
unsafe impl Send for PagedSpace {}

impl PagedSpace {
    pub fn new(name: &'static str, max_pages: usize) -> Self {
        assert!(max_pages >= 1);
        Self {
            name,
            pages: Vec::new(),
            max_pages,
            current_page: 0,
            allocation_top: 0,
            free_list: FreeList::new(),
            filler_maps: None,
            mc_page: 0,
            mc_top: 0,
            mc_relocated_end_offset: 0,
        }
    }

    /// Install the canonical filler maps once the heap has created them.
    pub(crate) fn set_filler_maps(&mut self, one_word: *mut Map, byte_array: *mut Map) {
        self.filler_maps = Some(FillerMaps {
            one_word,
            byte_array,
        });
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn grow(&mut self) -> HeapResult<()> {
        if self.pages.len() >= self.max_pages {
            return Err(HeapError::OutOfMemory(self.name));
        }
        let page = Page::allocate();
        // SAFETY: page is fresh; the previous last page (if any) is live.
        unsafe {
            (*page).mc_page_index = self.pages.len();
            if let Some(&last) = self.pages.last() {
                (*last).next_page = page;
            }
            self.current_page = self.pages.len();
            self.allocation_top = (*page).object_area_start();
        }
        self.pages.push(page);
        Ok(())
    }

    /// Linearly allocate `size` bytes, falling back to the free list and
    /// growing the page chain on demand.  Returned storage is not zeroed
    /// beyond what a fresh page provides; callers initialise it fully.
    pub fn allocate_raw(&mut self, size: usize) -> HeapResult<usize> {
        debug_assert!(size % POINTER_SIZE == 0, "object sizes are word-aligned");
        if size > OBJECT_AREA_SIZE {
            return Err(HeapError::ObjectTooLarge {
                size,
                limit: OBJECT_AREA_SIZE,
            });
        }

        if let Some((addr, block_size)) = self.free_list.take_block(size) {
            if block_size > size {
                // Re-cover the tail so heap walks still see sized objects.
                // SAFETY: the tail lies inside the freed block we now own.
                unsafe { self.install_filler(addr + size, block_size - size) };
                self.free_list.free(addr + size, block_size - size);
            }
            return Ok(addr);
        }

        if self.pages.is_empty() {
            self.grow()?;
        }
        loop {
            // SAFETY: current_page indexes a live page.
            let page_end = unsafe { (*self.pages[self.current_page]).object_area_end() };
            if self.allocation_top + size <= page_end {
                let addr = self.allocation_top;
                self.allocation_top += size;
                // SAFETY: current_page is live; top stays within the page.
                unsafe { (*self.pages[self.current_page]).allocation_top = self.allocation_top };
                return Ok(addr);
            }
            // The tail of this page is stranded: cover it with a filler so
            // walks still see sized objects, and account it as recoverable
            // waste.
            let leftover = page_end - self.allocation_top;
            if leftover > 0 {
                // SAFETY: the tail is allocator-owned storage in a live page.
                unsafe {
                    self.install_filler(self.allocation_top, leftover);
                    (*self.pages[self.current_page]).allocation_top = page_end;
                }
                self.allocation_top = page_end;
                self.free_list.add_waste(leftover);
            }
            if self.current_page + 1 < self.pages.len() {
                self.current_page += 1;
                // SAFETY: the next page is live.
                self.allocation_top =
                    unsafe { (*self.pages[self.current_page]).object_area_start() };
            } else {
                self.grow()?;
            }
        }
    }

    /// Return a swept dead block to the free list, covering it with a filler
    /// so subsequent heap walks can size it.
    ///
    /// # Safety
    /// `[addr, addr + size)` must be a dead, exclusively collector-owned
    /// range inside this space's walked area.
    pub unsafe fn free(&mut self, addr: usize, size: usize) {
        // SAFETY: per this function's contract.
        unsafe { self.install_filler(addr, size) };
        self.free_list.free(addr, size);
    }

    /// Free a dead range of map space in whole-map chunks.  Map-space
    /// consumers assume every free slot is exactly one map.
    ///
    /// # Safety
    /// As for [`free`][Self::free]; `size` must be a multiple of `MAP_SIZE`.
    pub unsafe fn free_map_chunks(&mut self, addr: usize, size: usize) {
        debug_assert!(size % MAP_SIZE == 0);
        let mut chunk = addr;
        while chunk < addr + size {
            // SAFETY: each chunk is within the caller-owned range.
            unsafe { self.install_filler(chunk, MAP_SIZE) };
            self.free_list.free(chunk, MAP_SIZE);
            chunk += MAP_SIZE;
        }
    }

    /// Write a sized filler object over `[addr, addr + size)`.
    ///
    /// # Safety
    /// The range must be writable, collector- or allocator-owned storage.
    pub(crate) unsafe fn install_filler(&self, addr: usize, size: usize) {
        let fillers = self
            .filler_maps
            .expect("filler maps must be set before freeing");
        // SAFETY: per this function's contract.
        unsafe {
            if size == POINTER_SIZE {
                (*HeapObject::from_address(addr)).set_map(fillers.one_word);
            } else {
                (*HeapObject::from_address(addr)).set_map(fillers.byte_array);
                (*(addr as *mut ByteArray)).set_length(ByteArray::length_for(size));
            }
        }
    }

    /// Bytes currently allocated to objects (gross extent minus free-list
    /// blocks and waste).
    pub fn size(&self) -> usize {
        self.gross_extent() - self.free_list.available() - self.free_list.waste()
    }

    /// Bytes between each page's object-area start and its allocation top.
    fn gross_extent(&self) -> usize {
        self.pages
            .iter()
            .map(|&p| {
                // SAFETY: pages in the chain are live.
                unsafe { (*p).allocation_top - (*p).object_area_start() }
            })
            .sum()
    }

    /// Bytes available on the free list.
    pub fn available_free(&self) -> usize {
        self.free_list.available()
    }

    /// Bytes stranded in blocks too small to reuse.
    pub fn waste(&self) -> usize {
        self.free_list.waste()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.pages.iter().any(|&p| {
            // SAFETY: pages in the chain are live.
            unsafe { (*p).contains(addr) }
        })
    }

    pub fn pages(&self) -> &[*mut Page] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Base address of the page with the given chain ordinal.
    pub fn page_address(&self, index: usize) -> usize {
        self.pages[index] as usize
    }

    // ── Mark-compact protocol ─────────────────────────────────────────────

    /// Reset per-page collector bookkeeping and (re)assign page ordinals.
    ///
    /// The free list is discarded here and rebuilt by whichever branch runs:
    /// the sweeper re-registers every dead run (old blocks coalesce with
    /// newly dead neighbours into maximal regions), and compaction leaves no
    /// holes at all.
    pub fn prepare_for_mark_compact(&mut self, _will_compact: bool) {
        self.free_list.clear();
        for (index, &page) in self.pages.iter().enumerate() {
            // SAFETY: pages in the chain are live.
            unsafe {
                (*page).mc_page_index = index;
                (*page).mc_first_forwarded = 0;
                (*page).mc_relocation_top = (*page).object_area_start();
            }
        }
    }

    /// Point the relocation arena at the low end of the page chain.
    pub fn mc_reset_relocation_info(&mut self) {
        self.mc_page = 0;
        self.mc_top = if self.pages.is_empty() {
            0
        } else {
            // SAFETY: the first page is live.
            unsafe { (*self.pages[0]).object_area_start() }
        };
        self.mc_relocated_end_offset = 0;
    }

    /// Allocate `size` destination bytes during compaction.
    ///
    /// Never splits an object across a page seam: when the current
    /// destination page cannot fit the request, its final relocation top is
    /// recorded and allocation moves to the next page.  Returns `None` only
    /// when the existing page chain is exhausted, which can happen for
    /// cross-space promotion but never for a space compacting into itself.
    pub fn mc_allocate_raw(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size % POINTER_SIZE == 0);
        debug_assert!(size <= OBJECT_AREA_SIZE);
        if self.pages.is_empty() {
            return None;
        }
        loop {
            // SAFETY: mc_page indexes a live page.
            let page_end = unsafe { (*self.pages[self.mc_page]).object_area_end() };
            if self.mc_top + size <= page_end {
                let addr = self.mc_top;
                self.mc_top += size;
                return Some(addr);
            }
            // SAFETY: mc_page indexes a live page.
            unsafe { (*self.pages[self.mc_page]).mc_relocation_top = self.mc_top };
            if self.mc_page + 1 >= self.pages.len() {
                return None;
            }
            self.mc_page += 1;
            // SAFETY: the advanced mc_page indexes a live page.
            self.mc_top = unsafe { (*self.pages[self.mc_page]).object_area_start() };
        }
    }

    /// Record the final relocation top in the current destination page so
    /// forwarding-address decoding can locate page seams.
    pub fn mc_write_relocation_info_to_page(&mut self) {
        if !self.pages.is_empty() {
            // SAFETY: mc_page indexes a live page.
            unsafe { (*self.pages[self.mc_page]).mc_relocation_top = self.mc_top };
        }
    }

    /// Linearised offset of `addr` within this space (page ordinal × page
    /// size + page offset); monotone along the destination layout.
    pub fn mc_space_offset_for_address(&self, addr: usize) -> usize {
        let page = Page::from_address(addr);
        // SAFETY: addr lies within one of this space's live pages.
        unsafe { (*page).mc_page_index * PAGE_SIZE + (*page).offset_of(addr) }
    }

    /// Note that `[addr, addr + size)` has been filled by relocation.
    pub fn mc_adjust_relocation_end(&mut self, addr: usize, size: usize) {
        let end_offset = self.mc_space_offset_for_address(addr) + size;
        if end_offset > self.mc_relocated_end_offset {
            self.mc_relocated_end_offset = end_offset;
        }
    }

    /// Commit the compacted layout: per-page and space-level allocation tops
    /// move to the relocation tops and the free list is discarded (the
    /// destination layout has no holes).
    pub fn mc_commit_relocation_info(&mut self) {
        if self.pages.is_empty() {
            return;
        }
        #[cfg(debug_assertions)]
        {
            // mc_top can sit exactly at a page end, so linearise it without
            // going through Page::from_address.
            let top_offset = {
                let page = self.pages[self.mc_page];
                // SAFETY: mc_page indexes a live page.
                unsafe { (*page).mc_page_index * PAGE_SIZE + (self.mc_top - page as usize) }
            };
            debug_assert!(
                self.mc_relocated_end_offset == 0 || self.mc_relocated_end_offset <= top_offset
            );
        }
        for (index, &page) in self.pages.iter().enumerate() {
            // SAFETY: pages in the chain are live.
            unsafe {
                (*page).allocation_top = if index < self.mc_page {
                    (*page).mc_relocation_top
                } else if index == self.mc_page {
                    self.mc_top
                } else {
                    (*page).object_area_start()
                };
            }
        }
        self.current_page = self.mc_page;
        self.allocation_top = self.mc_top;
        self.free_list.clear();
    }
}

impl Drop for PagedSpace {
    fn drop(&mut self) {
        for &page in &self.pages {
            // SAFETY: every page in the chain came from Page::allocate and is
            // dropped exactly once here.
            unsafe { Page::deallocate(page) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page::OBJECT_START_OFFSET;
    use crate::objects::map::InstanceType;

    fn space_with_fillers(max_pages: usize) -> (PagedSpace, Box<Map>, Box<Map>) {
        let mut one_word = Box::new(Map::new_detached(InstanceType::OneWordFiller, 8));
        let mut byte_array = Box::new(Map::new_detached(InstanceType::ByteArray, 0));
        let mut space = PagedSpace::new("test", max_pages);
        space.set_filler_maps(&raw mut *one_word, &raw mut *byte_array);
        (space, one_word, byte_array)
    }

    #[test]
    fn allocate_raw_bumps_within_a_page() {
        let mut space = PagedSpace::new("test", 4);
        let a = space.allocate_raw(32).unwrap();
        let b = space.allocate_raw(16).unwrap();
        assert_eq!(b, a + 32);
        assert_eq!(space.size(), 48);
    }

    #[test]
    fn first_allocation_starts_at_object_area() {
        let mut space = PagedSpace::new("test", 4);
        let a = space.allocate_raw(8).unwrap();
        assert_eq!(a % PAGE_SIZE, OBJECT_START_OFFSET);
    }

    #[test]
    fn page_spill_grows_the_chain_and_counts_waste() {
        let (mut space, _f1, _f2) = space_with_fillers(4);
        let big = OBJECT_AREA_SIZE - 8;
        space.allocate_raw(big).unwrap();
        // 8 bytes remain in page 0; a 16-byte request must spill to page 1.
        let b = space.allocate_raw(16).unwrap();
        assert_eq!(space.page_count(), 2);
        assert_eq!(b % PAGE_SIZE, OBJECT_START_OFFSET);
        assert_eq!(space.waste(), 8);
        assert_eq!(space.size(), big + 16, "stranded tail is not live size");
    }

    #[test]
    fn allocate_raw_fails_when_chain_is_full() {
        let mut space = PagedSpace::new("test", 1);
        space.allocate_raw(OBJECT_AREA_SIZE).unwrap();
        assert!(space.allocate_raw(8).is_err());
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let mut space = PagedSpace::new("test", 1);
        assert!(matches!(
            space.allocate_raw(OBJECT_AREA_SIZE + 8),
            Err(HeapError::ObjectTooLarge { .. })
        ));
    }

    #[test]
    fn freed_blocks_are_reused_with_filler_over_the_tail() {
        let (mut space, _f1, _f2) = space_with_fillers(2);
        let a = space.allocate_raw(64).unwrap();
        space.allocate_raw(8).unwrap();
        // SAFETY: [a, a+64) was allocated above and is dead for this test.
        unsafe { space.free(a, 64) };
        assert_eq!(space.available_free(), 64);
        let b = space.allocate_raw(32).unwrap();
        assert_eq!(b, a, "free block must be reused first-fit");
        assert_eq!(space.available_free(), 32);
        // The tail got a sized filler.
        // SAFETY: the filler was installed in storage the space owns.
        let tail = unsafe { &*((a + 32) as *mut ByteArray) };
        assert_eq!(tail.size(), 32);
    }

    #[test]
    fn tiny_freed_blocks_become_waste() {
        let (mut space, _f1, _f2) = space_with_fillers(2);
        let a = space.allocate_raw(8).unwrap();
        // SAFETY: the 8-byte block is dead for this test.
        unsafe { space.free(a, 8) };
        assert_eq!(space.available_free(), 0);
        assert_eq!(space.waste(), 8);
    }

    #[test]
    fn free_map_chunks_registers_one_block_per_map() {
        let (mut space, _f1, _f2) = space_with_fillers(2);
        let a = space.allocate_raw(3 * MAP_SIZE).unwrap();
        // SAFETY: the range is dead for this test.
        unsafe { space.free_map_chunks(a, 3 * MAP_SIZE) };
        assert_eq!(space.available_free(), 3 * MAP_SIZE);
        // Each chunk is separately allocatable at exactly MAP_SIZE.
        for _ in 0..3 {
            assert!(space.allocate_raw(MAP_SIZE).is_ok());
        }
        assert_eq!(space.available_free(), 0);
    }

    #[test]
    fn mc_allocation_restarts_at_the_chain_bottom() {
        let mut space = PagedSpace::new("test", 4);
        let a = space.allocate_raw(64).unwrap();
        space.allocate_raw(64).unwrap();
        space.prepare_for_mark_compact(true);
        space.mc_reset_relocation_info();
        let d = space.mc_allocate_raw(32).unwrap();
        assert_eq!(d, a, "first destination is the first source address");
        let d2 = space.mc_allocate_raw(32).unwrap();
        assert_eq!(d2, a + 32);
    }

    #[test]
    fn mc_allocation_spills_record_page_tops() {
        let mut space = PagedSpace::new("test", 4);
        // Two pages of content.
        space.allocate_raw(OBJECT_AREA_SIZE).unwrap();
        space.allocate_raw(64).unwrap();
        space.prepare_for_mark_compact(true);
        space.mc_reset_relocation_info();
        let first = space.mc_allocate_raw(OBJECT_AREA_SIZE - 8).unwrap();
        // Next request cannot fit in page 0.
        let second = space.mc_allocate_raw(16).unwrap();
        assert_ne!(Page::from_address(first), Page::from_address(second));
        // SAFETY: page 0 is live.
        let page0 = space.pages()[0];
        unsafe {
            assert_eq!(
                (*page0).mc_relocation_top,
                (*page0).object_area_start() + OBJECT_AREA_SIZE - 8
            );
        }
    }

    #[test]
    fn mc_commit_moves_allocation_tops_to_relocation_tops() {
        let mut space = PagedSpace::new("test", 4);
        space.allocate_raw(128).unwrap();
        space.prepare_for_mark_compact(true);
        space.mc_reset_relocation_info();
        let dest = space.mc_allocate_raw(48).unwrap();
        space.mc_write_relocation_info_to_page();
        space.mc_adjust_relocation_end(dest, 48);
        space.mc_commit_relocation_info();
        assert_eq!(space.size(), 48);
        // Fresh allocation continues right after the compacted prefix.
        let next = space.allocate_raw(16).unwrap();
        assert_eq!(next, dest + 48);
    }

    #[test]
    fn mc_space_offset_is_monotone_across_pages() {
        let mut space = PagedSpace::new("test", 4);
        let a = space.allocate_raw(OBJECT_AREA_SIZE).unwrap();
        let b = space.allocate_raw(64).unwrap();
        space.prepare_for_mark_compact(true);
        assert!(space.mc_space_offset_for_address(a) < space.mc_space_offset_for_address(b));
    }
}
