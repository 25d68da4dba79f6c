//! Phase 4b: the non-compacting sweeper.
//!
//! Clears marks on live objects and returns dead runs to each space's free
//! list.  Sweep order is old, code, new, then map space last: freeing map
//! space overwrites dead maps, and the other spaces may still need them to
//! size their own dead objects.

use crate::gc::collector::{CollectorState, MarkCompactCollector};
use crate::gc::marking::object_size_ignoring_marks;
use crate::gc::tracer::GcTracer;
use crate::heap::page::{Page, POINTER_SIZE};
use crate::heap::paged_space::PagedSpace;
use crate::heap::{Heap, SpaceId};
use crate::objects::array::{ByteArray, BYTE_ARRAY_HEADER_SIZE};
use crate::objects::code::Code;
use crate::objects::heap_object::HeapObject;
use crate::objects::map::InstanceType;

/// Return one dead run to its space.
///
/// Old and map space also drop the remembered-set bits over the range; map
/// space is freed in whole-map chunks because its consumers assume every
/// free slot is exactly one map.
///
/// # Safety
/// `[start, start + size)` must be a dead run inside one page of `space`.
unsafe fn deallocate_block(space: &mut PagedSpace, id: SpaceId, start: usize, size: usize) {
    // SAFETY: per this function's contract.
    unsafe {
        match id {
            SpaceId::Old => {
                (*Page::from_address(start)).clear_rset_range(start, size);
                space.free(start, size);
            }
            SpaceId::Code => {
                space.free(start, size);
            }
            SpaceId::Map => {
                (*Page::from_address(start)).clear_rset_range(start, size);
                space.free_map_chunks(start, size);
            }
            _ => unreachable!("not a swept paged space: {id:?}"),
        }
    }
}

/// Sweep one paged space in place.
///
/// # Safety
/// The space must be in its marking-phase state (normal map words, marks on
/// live objects).
unsafe fn sweep_paged_space(
    space: &mut PagedSpace,
    id: SpaceId,
    tracer: &mut GcTracer,
    was_compacting: bool,
) {
    let pages: Vec<*mut Page> = space.pages().to_vec();
    for page in pages {
        let mut is_prev_alive = true;
        let mut free_start = 0usize;
        // SAFETY: pages are live; the object run below the top is walkable.
        unsafe {
            let top = (*page).allocation_top;
            let mut current = (*page).object_area_start();
            while current < top {
                let obj = HeapObject::from_address(current);
                let size = object_size_ignoring_marks(obj);
                if (*obj).is_marked() {
                    (*obj).clear_mark();
                    tracer.decrement_marked_count();
                    if was_compacting
                        && (*(*obj).map()).instance_type() == InstanceType::Code
                    {
                        // A compacting decision flipped call sites to object
                        // form during marking; restore them.  The sweep-only
                        // branch never reaches here.
                        (*(obj as *mut Code)).convert_ic_targets_to_address();
                    }
                    if !is_prev_alive {
                        deallocate_block(space, id, free_start, current - free_start);
                        is_prev_alive = true;
                    }
                } else {
                    if (*(*obj).map()).instance_type() == InstanceType::Code {
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
                deallocate_block(space, id, free_start, top - free_start);
            }
        }
    }
}

impl MarkCompactCollector<'_> {
    /// Phase 4b: sweep every space in place, freeing dead regions and
    /// clearing marks.
    ///
    /// # Safety
    /// Marking must have completed; called only in [`collect`] order on the
    /// non-compacting branch.
    pub(crate) unsafe fn sweep_spaces(&mut self) {
        debug_assert_eq!(self.state, CollectorState::SweepSpaces);
        debug_assert!(!self.compacting);

        let MarkCompactCollector {
            heap,
            tracer,
            compacting,
            ..
        } = self;
        let heap: &mut Heap = &mut **heap;
        let tracer: &mut GcTracer = &mut **tracer;
        let was_compacting = *compacting;

        // SAFETY: marking-phase heap state per this function's contract.
        unsafe {
            sweep_paged_space(&mut heap.old_space, SpaceId::Old, tracer, was_compacting);
            sweep_paged_space(&mut heap.code_space, SpaceId::Code, tracer, was_compacting);
            sweep_new_space(heap, tracer);
            sweep_paged_space(&mut heap.map_space, SpaceId::Map, tracer, was_compacting);
        }
    }
}

/// Sweep new space in place: clear marks on the live, and give every dead
/// region a filler map so later walks can size it.  The allocation top is
/// unchanged; young storage is only reclaimed by compacting collections.
///
/// # Safety
/// As for [`sweep_paged_space`], against the active semi-space half.
unsafe fn sweep_new_space(heap: &mut Heap, tracer: &mut GcTracer) {
    let byte_array_map = heap.byte_array_map();
    let one_word_filler_map = heap.one_word_filler_map();
    let top = heap.new_space.top();
    let mut current = heap.new_space.bottom();
    // SAFETY: the active half below top is a walkable object run.
    unsafe {
        while current < top {
            let obj = HeapObject::from_address(current);
            let size = object_size_ignoring_marks(obj);
            if (*obj).is_marked() {
                (*obj).clear_mark();
                tracer.decrement_marked_count();
            } else {
                // The dead object's own map may die with this collection;
                // re-describe the storage so its size stays computable.
                if size >= BYTE_ARRAY_HEADER_SIZE {
                    (*obj).set_map(byte_array_map);
                    (*(obj as *mut ByteArray)).set_length(ByteArray::length_for(size));
                } else {
                    debug_assert_eq!(size, POINTER_SIZE);
                    (*obj).set_map(one_word_filler_map);
                }
                debug_assert_eq!(object_size_ignoring_marks(obj), size);
            }
            current += size;
        }
    }
}
