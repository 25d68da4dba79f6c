//! Phase 4a-1: encode forwarding addresses.
//!
//! For each compactable space, compute where every live object will land and
//! write that destination into the object's map word as a packed encoding.
//! The write destroys the original map pointer, so every later phase decodes
//! maps from the encoding instead of dereferencing the word.
//!
//! Maximal dead runs are overwritten with one of two sentinel encodings so
//! later walks can skip them: a single-word run holds [`SINGLE_FREE_ENCODING`]
//! in its only word; a longer run holds [`MULTI_FREE_ENCODING`] in its first
//! word and the run's byte size in its second.  Both sentinels are invalid
//! map-page offsets, so they can never be confused with a real encoding.
//!
//! Space order is old, code, new, map.  Old and code go first because
//! new-space promotion consumes their allocation budget.  Map space goes
//! last because sizing any dead object reads its map's fields, and a dead
//! object's map may itself be dead: encoding map space overwrites dead maps
//! with free-region sentinels.

use crate::gc::collector::{CollectorState, MarkCompactCollector};
use crate::heap::page::{Page, OBJECT_AREA_SIZE, POINTER_SIZE};
use crate::heap::paged_space::PagedSpace;
use crate::heap::{Heap, SpaceId};
use crate::objects::heap_object::{HeapObject, MapWord};
use crate::objects::map::InstanceType;

/// First word of a one-word dead region.
pub(crate) const SINGLE_FREE_ENCODING: usize = 0;
/// First word of a multi-word dead region; the second word holds its size.
pub(crate) const MULTI_FREE_ENCODING: usize = 1;

/// Overwrite `[start, start + size)` with a free-region encoding.
///
/// # Safety
/// The range must be dead, collector-owned storage of at least one word.
pub(crate) unsafe fn encode_free_region(start: usize, size: usize) {
    debug_assert!(size >= POINTER_SIZE);
    // SAFETY: per this function's contract.
    unsafe {
        if size == POINTER_SIZE {
            *(start as *mut usize) = SINGLE_FREE_ENCODING;
        } else {
            debug_assert!(size >= 2 * POINTER_SIZE);
            *(start as *mut usize) = MULTI_FREE_ENCODING;
            *((start + POINTER_SIZE) as *mut usize) = size;
        }
    }
}

/// Walk the live objects of an encoded range, skipping free regions.
///
/// `size_of` receives each live object and returns its size (it may also
/// process the object).  Returns the number of live objects seen.
///
/// # Safety
/// The range must be in its encoded state: every dead run carries a
/// free-region encoding and `size_of` must return correct sizes.
pub(crate) unsafe fn iterate_live_objects_in_range(
    start: usize,
    end: usize,
    mut size_of: impl FnMut(*mut HeapObject) -> usize,
) -> usize {
    let mut live = 0;
    let mut current = start;
    while current < end {
        // SAFETY: current always sits on a live object or a free encoding.
        let first_word = unsafe { *(current as *const usize) };
        if first_word == SINGLE_FREE_ENCODING {
            current += POINTER_SIZE;
        } else if first_word == MULTI_FREE_ENCODING {
            // SAFETY: a multi-word region's second word holds its size.
            current += unsafe { *((current + POINTER_SIZE) as *const usize) };
        } else {
            live += 1;
            current += size_of(HeapObject::from_address(current));
        }
    }
    debug_assert_eq!(current, end);
    live
}

/// Walk the live objects of every page of an encoded paged space.
///
/// # Safety
/// As for [`iterate_live_objects_in_range`].
pub(crate) unsafe fn iterate_live_objects_in_paged_space(
    space: &PagedSpace,
    mut size_of: impl FnMut(*mut HeapObject) -> usize,
) -> usize {
    let mut live = 0;
    for &page in space.pages() {
        // SAFETY: pages in the chain are live; per-page ranges are encoded.
        unsafe {
            live += iterate_live_objects_in_range(
                (*page).object_area_start(),
                (*page).allocation_top,
                &mut size_of,
            );
        }
    }
    live
}

fn paged_space_mut(heap: &mut Heap, id: SpaceId) -> &mut PagedSpace {
    match id {
        SpaceId::Old => &mut heap.old_space,
        SpaceId::Code => &mut heap.code_space,
        SpaceId::Map => &mut heap.map_space,
        _ => unreachable!("not a paged space: {id:?}"),
    }
}

impl MarkCompactCollector<'_> {
    /// Phase 4a-1: compute and install every forwarding address.
    ///
    /// # Safety
    /// Marking must have completed; called only in [`collect`] order.
    pub(crate) unsafe fn encode_forwarding_addresses(&mut self) {
        debug_assert_eq!(self.state, CollectorState::EncodeForwardingAddresses);

        // Non-promoted young objects relocate into the inactive semi-space.
        self.heap.new_space.mc_reset_relocation_info();
        self.heap.old_space.mc_reset_relocation_info();
        self.heap.code_space.mc_reset_relocation_info();
        self.heap.map_space.mc_reset_relocation_info();

        // SAFETY: per this function's contract.
        unsafe {
            self.encode_in_paged_space(SpaceId::Old, false);
            self.encode_in_paged_space(SpaceId::Code, true);
            // New space after old and code: promotion allocates out of their
            // relocation arenas.
            self.encode_in_new_space();
            self.encode_in_paged_space(SpaceId::Map, false);
        }

        // Record the final destination tops so forwarding decode can locate
        // page seams.  Done after new-space promotion so the tops include
        // promoted objects.
        self.heap.old_space.mc_write_relocation_info_to_page();
        self.heap.code_space.mc_write_relocation_info_to_page();
        self.heap.map_space.mc_write_relocation_info_to_page();
    }

    /// Encode one paged space, which compacts into its own pages.
    ///
    /// # Safety
    /// As for [`encode_forwarding_addresses`].
    unsafe fn encode_in_paged_space(&mut self, id: SpaceId, log_dead_code: bool) {
        let MarkCompactCollector {
            heap,
            tracer,
            flags,
            ..
        } = self;
        let heap: &mut Heap = &mut **heap;
        let verbose = flags.gc_verbose;
        let space = paged_space_mut(heap, id);
        let pages: Vec<*mut Page> = space.pages().to_vec();

        for page in pages {
            // Live-byte offset of the next live object from the page start.
            let mut offset = 0usize;
            let mut free_start = 0usize;
            let mut is_prev_alive = true;
            // SAFETY: pages are live; objects below the allocation top are
            // walkable with normal map words until this loop encodes them.
            unsafe {
                let top = (*page).allocation_top;
                let mut current = (*page).object_area_start();
                while current < top {
                    let obj = HeapObject::from_address(current);
                    let size;
                    if (*obj).is_marked() {
                        (*obj).clear_mark();
                        tracer.decrement_marked_count();
                        size = (*obj).size();

                        // Destination allocation cannot fail: the live set
                        // fits the pages it came from.
                        let dest = space
                            .mc_allocate_raw(size)
                            .expect("in-space compaction allocation failed");
                        if offset == 0 {
                            (*page).mc_first_forwarded = dest;
                        }
                        let map_addr = (*obj).map() as usize;
                        (*obj).set_map_word(MapWord::encode_forwarding(map_addr, offset));
                        offset += size;
                        debug_assert!(offset <= OBJECT_AREA_SIZE);

                        if verbose {
                            tracing::debug!(target: "gc", from = current, to = dest, "forward");
                        }
                        if !is_prev_alive {
                            encode_free_region(free_start, current - free_start);
                            is_prev_alive = true;
                        }
                    } else {
                        size = (*obj).size();
                        if log_dead_code
                            && (*(*obj).map()).instance_type() == InstanceType::Code
                        {
                            tracing::debug!(target: "code", address = current, "code delete");
                        }
                        if is_prev_alive {
                            free_start = current;
                            is_prev_alive = false;
                        }
                    }
                    current += size;
                }
                if !is_prev_alive {
                    encode_free_region(free_start, top - free_start);
                }
            }
        }
    }

    /// Encode new space: live young objects promote to old or code space
    /// per the promotion policy, staying young (in the inactive semi-space)
    /// only when the target space is full.  The forwarding address is stored
    /// out of line, in from-space at the object's to-space offset, so young
    /// map words stay intact.
    ///
    /// # Safety
    /// As for [`encode_forwarding_addresses`].
    unsafe fn encode_in_new_space(&mut self) {
        let MarkCompactCollector {
            heap,
            tracer,
            flags,
            ..
        } = self;
        let heap: &mut Heap = &mut **heap;
        let verbose = flags.gc_verbose;

        let bottom = heap.new_space.bottom();
        let top = heap.new_space.top();
        let from_low = heap.new_space.from_space_low();

        let mut free_start = 0usize;
        let mut is_prev_alive = true;
        let mut current = bottom;
        // SAFETY: the active half below top is a walkable object run; the
        // inactive half is collector scratch.
        unsafe {
            while current < top {
                let obj = HeapObject::from_address(current);
                let size;
                if (*obj).is_marked() {
                    (*obj).clear_mark();
                    tracer.decrement_marked_count();
                    size = (*obj).size();

                    let promoted = match heap.target_space(obj) {
                        SpaceId::Old => heap.old_space.mc_allocate_raw(size),
                        SpaceId::Code => heap.code_space.mc_allocate_raw(size),
                        _ => unreachable!("promotion targets are paged spaces"),
                    };
                    // A full target space leaves the object young.
                    let dest =
                        promoted.unwrap_or_else(|| heap.new_space.mc_allocate_raw(size));
                    *((from_low + (current - bottom)) as *mut usize) = dest;

                    if verbose {
                        tracing::debug!(target: "gc", from = current, to = dest, "forward");
                    }
                    if !is_prev_alive {
                        encode_free_region(free_start, current - free_start);
                        is_prev_alive = true;
                    }
                } else {
                    size = (*obj).size();
                    if is_prev_alive {
                        free_start = current;
                        is_prev_alive = false;
                    }
                }
                current += size;
            }
            if !is_prev_alive {
                encode_free_region(free_start, top - free_start);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::CollectorFlags;
    use crate::gc::tracer::GcTracer;
    use crate::handles::GlobalHandles;
    use crate::heap::HeapConfig;

    /// Drive the compacting pipeline up to the end of the encoding phase and
    /// check the sentinel layout of dead runs: a one-word region at the end
    /// of old space's used area, and a whole code-space page occupied by one
    /// dead object.
    #[test]
    fn encoding_covers_dead_runs_with_maximal_sentinels() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();
        let mut tracer = GcTracer::new();
        let flags = CollectorFlags {
            always_compact: true,
            ..CollectorFlags::default()
        };

        // A dead one-word object at the current end of old space.
        let filler_map = heap.one_word_filler_map();
        let dead_word = heap.allocate_object(SpaceId::Old, POINTER_SIZE).unwrap();
        // SAFETY: dead_word is fresh storage; the filler map is live.
        unsafe { (*HeapObject::from_address(dead_word)).set_map(filler_map) };

        // Fill the rest of code-space page 0, then cover page 1 with a
        // single dead object.
        let page0_remainder = OBJECT_AREA_SIZE - heap.code_space.size();
        heap.allocate_byte_array(SpaceId::Code, page0_remainder - 16)
            .unwrap();
        heap.allocate_byte_array(SpaceId::Code, OBJECT_AREA_SIZE - 16)
            .unwrap();
        assert_eq!(heap.code_space.page_count(), 2);
        // SAFETY: page 1 exists and is live.
        let page1_start = unsafe { (*heap.code_space.pages()[1]).object_area_start() };

        let mut collector =
            MarkCompactCollector::new(&mut heap, &mut handles, &mut tracer, &flags);
        // SAFETY: the test heap is quiescent; phases run in collect() order.
        unsafe {
            collector.prepare();
            collector.mark_live_objects();
            collector.sweep_large_object_space();
            collector.encode_forwarding_addresses();

            assert_eq!(
                *(dead_word as *const usize),
                SINGLE_FREE_ENCODING,
                "a lone dead word gets the single-word sentinel"
            );
            assert_eq!(
                *(page1_start as *const usize),
                MULTI_FREE_ENCODING,
                "a fully dead page becomes one region"
            );
            assert_eq!(
                *((page1_start + POINTER_SIZE) as *const usize),
                OBJECT_AREA_SIZE,
                "the region covers the whole object area"
            );
        }
    }

    #[test]
    fn single_word_region_gets_the_single_sentinel() {
        let mut buf = vec![0xffusize; 4];
        let base = buf.as_mut_ptr() as usize;
        // SAFETY: buf is local writable storage.
        unsafe { encode_free_region(base, POINTER_SIZE) };
        assert_eq!(buf[0], SINGLE_FREE_ENCODING);
        assert_eq!(buf[1], 0xff, "only the first word is touched");
    }

    #[test]
    fn multi_word_region_records_its_size() {
        let mut buf = vec![0xffusize; 4];
        let base = buf.as_mut_ptr() as usize;
        // SAFETY: buf is local writable storage.
        unsafe { encode_free_region(base, 3 * POINTER_SIZE) };
        assert_eq!(buf[0], MULTI_FREE_ENCODING);
        assert_eq!(buf[1], 3 * POINTER_SIZE);
    }

    #[test]
    fn live_walker_skips_free_regions_and_counts_live_objects() {
        // Layout: [multi free 24][live 16][single free 8][live 8].
        let mut buf = vec![0usize; 7];
        let base = buf.as_mut_ptr() as usize;
        // SAFETY: buf is local writable storage laid out as above.
        unsafe {
            encode_free_region(base, 3 * POINTER_SIZE);
            *((base + 3 * POINTER_SIZE) as *mut usize) = 0xdead_0000; // live "map word"
            encode_free_region(base + 5 * POINTER_SIZE, POINTER_SIZE);
            *((base + 6 * POINTER_SIZE) as *mut usize) = 0xbeef_0000; // live "map word"

            let mut seen = Vec::new();
            let live = iterate_live_objects_in_range(base, base + 7 * POINTER_SIZE, |obj| {
                seen.push(obj as usize);
                if obj as usize == base + 3 * POINTER_SIZE {
                    2 * POINTER_SIZE
                } else {
                    POINTER_SIZE
                }
            });
            assert_eq!(live, 2);
            assert_eq!(seen, vec![base + 3 * POINTER_SIZE, base + 6 * POINTER_SIZE]);
        }
    }
}
