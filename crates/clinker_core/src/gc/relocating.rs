//! Phase 4a-3: relocate objects.
//!
//! Every pointer already references forwarded addresses; this phase slides
//! the object bytes themselves.  Map space goes first because relocating any
//! other object reads its map — at the map's *new* address — to compute the
//! size.  Within a space, objects are visited in address order and
//! destinations are monotone, so an overlap-safe forward copy suffices.

use crate::gc::collector::{CollectorState, MarkCompactCollector};
use crate::gc::encoding::iterate_live_objects_in_range;
use crate::gc::updating::get_forwarding_address;
use crate::heap::page::Page;
use crate::heap::paged_space::PagedSpace;
use crate::heap::{Heap, HeapView, SpaceId};
use crate::objects::code::Code;
use crate::objects::heap_object::HeapObject;
use crate::objects::map::{InstanceType, Map, MAP_SIZE};

/// Relocate one map object.  Maps are uniform-size, so no size computation
/// through another map is needed.  Returns [`MAP_SIZE`].
///
/// # Safety
/// `obj` must be a live, encoded map-space object; map space must be the
/// first space relocated.
unsafe fn relocate_map_object(obj: *mut HeapObject, view: &HeapView, verbose: bool) -> usize {
    // SAFETY: per this function's contract.
    unsafe {
        let encoding = (*obj).map_word();
        let map_addr = view.decode_map_address(encoding);
        debug_assert!(view.in_map_space(map_addr));

        // Forwarding must be read before the encoding is destroyed.
        let new_addr = get_forwarding_address(obj as usize);
        (*obj).set_map(map_addr as *mut Map);

        let old_addr = obj as usize;
        if new_addr != old_addr {
            // The meta map may not have been copied yet; the bytes at
            // old_addr are authoritative.  Overlap-safe move.
            std::ptr::copy(old_addr as *const u8, new_addr as *mut u8, MAP_SIZE);
        }
        if verbose {
            tracing::debug!(target: "gc", from = old_addr, to = new_addr, "relocate");
        }
        MAP_SIZE
    }
}

/// Relocate one old-space object.  Returns its size.
///
/// # Safety
/// `obj` must be a live, encoded old-space object; map space must already be
/// relocated.
unsafe fn relocate_old_object(
    obj: *mut HeapObject,
    space: &mut PagedSpace,
    view: &HeapView,
    verbose: bool,
) -> usize {
    // SAFETY: per this function's contract.
    unsafe {
        let encoding = (*obj).map_word();
        let map_addr = view.decode_map_address(encoding);
        let new_addr = get_forwarding_address(obj as usize);
        (*obj).set_map(map_addr as *mut Map);

        // The map was relocated first, so sizing through it is valid here.
        let size = (*obj).size();
        let old_addr = obj as usize;
        debug_assert!(
            space.mc_space_offset_for_address(new_addr)
                <= space.mc_space_offset_for_address(old_addr)
        );
        space.mc_adjust_relocation_end(new_addr, size);

        if new_addr != old_addr {
            std::ptr::copy(old_addr as *const u8, new_addr as *mut u8, size);
        }

        let copied = HeapObject::from_address(new_addr);
        if (*(*copied).map()).instance_type() == InstanceType::Code {
            (*(copied as *mut Code)).relocate(new_addr as isize - old_addr as isize);
            tracing::debug!(target: "code", from = old_addr, to = new_addr, "code move");
        }
        if verbose {
            tracing::debug!(target: "gc", from = old_addr, to = new_addr, "relocate");
        }
        size
    }
}

/// Relocate one code-space object, switching its call sites back to address
/// form against the old layout before the bytes move.  Returns its size.
///
/// # Safety
/// As for [`relocate_old_object`], against code space.
unsafe fn relocate_code_object(
    obj: *mut HeapObject,
    space: &mut PagedSpace,
    view: &HeapView,
    verbose: bool,
) -> usize {
    // SAFETY: per this function's contract.
    unsafe {
        let encoding = (*obj).map_word();
        let map_addr = view.decode_map_address(encoding);
        let new_addr = get_forwarding_address(obj as usize);
        (*obj).set_map(map_addr as *mut Map);

        let size = (*obj).size();
        let old_addr = obj as usize;
        debug_assert!(
            space.mc_space_offset_for_address(new_addr)
                <= space.mc_space_offset_for_address(old_addr)
        );
        space.mc_adjust_relocation_end(new_addr, size);

        // Call-site targets hold forwarded object pointers; convert them to
        // entry addresses while the object is still at its old location.
        if (*(*obj).map()).instance_type() == InstanceType::Code {
            (*(obj as *mut Code)).convert_ic_targets_to_address();
        }

        if new_addr != old_addr {
            std::ptr::copy(old_addr as *const u8, new_addr as *mut u8, size);
        }

        let copied = HeapObject::from_address(new_addr);
        if (*(*copied).map()).instance_type() == InstanceType::Code {
            (*(copied as *mut Code)).relocate(new_addr as isize - old_addr as isize);
            tracing::debug!(target: "code", from = old_addr, to = new_addr, "code move");
        }
        if verbose {
            tracing::debug!(target: "gc", from = old_addr, to = new_addr, "relocate");
        }
        size
    }
}

/// Relocate one young object to its out-of-line forwarding address: into the
/// inactive semi-space, or a paged space when promoted.  Source and
/// destination never alias.  Returns its size.
///
/// # Safety
/// `obj` must be a live active-half object whose map word was updated; map
/// space must already be relocated.
unsafe fn relocate_new_object(
    obj: *mut HeapObject,
    heap: &mut Heap,
    verbose: bool,
) -> usize {
    // SAFETY: per this function's contract.
    unsafe {
        let size = (*obj).size();
        let old_addr = obj as usize;
        let offset = heap.new_space.to_space_offset_for_address(old_addr);
        let new_addr = *((heap.new_space.from_space_low() + offset) as *const usize);

        if heap.new_space.from_space_contains(new_addr) {
            // Staying young: destinations pack below their sources.
            debug_assert!(
                heap.new_space.from_space_offset_for_address(new_addr) <= offset
            );
        } else {
            match heap.target_space(obj) {
                SpaceId::Old => heap.old_space.mc_adjust_relocation_end(new_addr, size),
                SpaceId::Code => heap.code_space.mc_adjust_relocation_end(new_addr, size),
                _ => unreachable!("promotion targets are paged spaces"),
            }
        }

        // The semi-space halves are disjoint, as are promotions.
        std::ptr::copy_nonoverlapping(old_addr as *const u8, new_addr as *mut u8, size);
        if verbose {
            tracing::debug!(target: "gc", from = old_addr, to = new_addr, "relocate");
        }
        size
    }
}

impl MarkCompactCollector<'_> {
    /// Phase 4a-3: slide every live object to its forwarded address, flip
    /// the semi-spaces, and commit the new allocation tops.
    ///
    /// # Safety
    /// Pointer updating must have completed; called only in [`collect`]
    /// order.
    pub(crate) unsafe fn relocate_objects(&mut self) {
        debug_assert_eq!(self.state, CollectorState::UpdatePointers);
        self.state = CollectorState::RelocateObjects;

        let MarkCompactCollector {
            heap, view, flags, ..
        } = self;
        let heap: &mut Heap = &mut **heap;
        let view: &HeapView = &*view;
        let verbose = flags.gc_verbose;

        // SAFETY: all spaces are in their post-update encoded state.
        let (live_maps, live_olds, live_codes, live_news) = unsafe {
            let map_pages: Vec<*mut Page> = heap.map_space.pages().to_vec();
            let mut live_maps = 0;
            for page in map_pages {
                live_maps += iterate_live_objects_in_range(
                    (*page).object_area_start(),
                    (*page).allocation_top,
                    |obj| relocate_map_object(obj, view, verbose),
                );
            }

            let old_pages: Vec<*mut Page> = heap.old_space.pages().to_vec();
            let mut live_olds = 0;
            for page in old_pages {
                live_olds += iterate_live_objects_in_range(
                    (*page).object_area_start(),
                    (*page).allocation_top,
                    |obj| relocate_old_object(obj, &mut heap.old_space, view, verbose),
                );
            }

            let code_pages: Vec<*mut Page> = heap.code_space.pages().to_vec();
            let mut live_codes = 0;
            for page in code_pages {
                live_codes += iterate_live_objects_in_range(
                    (*page).object_area_start(),
                    (*page).allocation_top,
                    |obj| relocate_code_object(obj, &mut heap.code_space, view, verbose),
                );
            }

            let new_bottom = heap.new_space.bottom();
            let new_top = heap.new_space.top();
            let live_news =
                iterate_live_objects_in_range(new_bottom, new_top, |obj| {
                    relocate_new_object(obj, heap, verbose)
                });

            // Large code objects did not move, but their call sites were
            // switched to object form during marking; switch them back.
            for addr in heap.lo_space.object_addresses() {
                let obj = HeapObject::from_address(addr);
                if (*(*obj).map()).instance_type() == InstanceType::Code {
                    let code = obj as *mut Code;
                    if (*code).ic_targets_are_objects() {
                        (*code).convert_ic_targets_to_address();
                    }
                }
            }

            (live_maps, live_olds, live_codes, live_news)
        };

        heap.new_space.flip();
        let mark = heap.new_space.bottom();
        heap.new_space.set_age_mark(mark);
        heap.new_space.mc_commit_relocation_info();
        heap.map_space.mc_commit_relocation_info();
        heap.old_space.mc_commit_relocation_info();
        heap.code_space.mc_commit_relocation_info();

        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(live_maps, self.live_tally.map);
            debug_assert_eq!(live_olds, self.live_tally.old);
            debug_assert_eq!(live_codes, self.live_tally.code);
            debug_assert_eq!(live_news, self.live_tally.young);
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = (live_maps, live_olds, live_codes, live_news);
        }
    }
}
