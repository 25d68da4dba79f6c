//! Phase 4a-2: update pointers.
//!
//! Every live object now carries an encoded forwarding reference in place of
//! its map pointer (paged spaces) or an out-of-line forwarding slot in
//! from-space (new space).  This phase rewrites every stored pointer — roots,
//! weak roots, and every slot in every live object — to the forwarded
//! address of its target.

use crate::gc::collector::{CollectorState, MarkCompactCollector};
use crate::gc::encoding::{iterate_live_objects_in_paged_space, iterate_live_objects_in_range};
use crate::heap::page::{Page, OBJECT_START_OFFSET};
use crate::heap::{Heap, HeapView};
use crate::objects::heap_object::{HeapObject, MapWord};
use crate::objects::map::Map;
use crate::objects::tagged::TaggedValue;
use crate::objects::visit::ObjectVisitor;
use crate::objects::{iterate_body, object_size};

/// Resolve the forwarded address of a paged-space object from its encoded
/// map word and its source page's bookkeeping.
///
/// The encoded offset counts live bytes from the first live object of the
/// source page.  That first object's destination is `mc_first_forwarded`;
/// when the candidate lands past the destination page's `mc_relocation_top`,
/// the run spilled into the next page of the chain.
///
/// # Safety
/// `obj_addr` must reference a live paged-space object in its encoded state,
/// on a page whose `mc_*` fields were written by the encoding phase.
pub(crate) unsafe fn get_forwarding_address(obj_addr: usize) -> usize {
    let obj = HeapObject::from_address(obj_addr);
    // SAFETY: per this function's contract.
    unsafe {
        let encoding = (*obj).map_word();
        let offset = encoding.decode_offset();

        let page = Page::from_address(obj_addr);
        let first_forwarded = (*page).mc_first_forwarded;
        debug_assert!(first_forwarded != 0, "page has no forwarded objects");

        let forwarded_page = Page::from_address(first_forwarded);
        let forwarded_offset = (*forwarded_page).offset_of(first_forwarded);
        let top_offset = (*forwarded_page).offset_of((*forwarded_page).mc_relocation_top);

        if forwarded_offset + offset < top_offset {
            return first_forwarded + offset;
        }

        // The live run spilled into the next destination page.
        let next = (*forwarded_page).next_page;
        debug_assert!(!next.is_null(), "forwarding spill past the page chain");
        let adjusted = offset - (top_offset - forwarded_offset) + OBJECT_START_OFFSET;
        let address = (*next).address_at_offset(adjusted);
        debug_assert!(address < (*next).mc_relocation_top);
        address
    }
}

/// Rewrites one slot to its target's forwarded address.
pub(crate) struct UpdatingVisitor<'a> {
    pub(crate) view: &'a HeapView,
    pub(crate) verbose: bool,
}

impl UpdatingVisitor<'_> {
    /// # Safety
    /// `slot` must be a live tagged slot whose referent (if any) is a live
    /// object in its post-encoding state.
    unsafe fn update_pointer(&mut self, slot: *mut TaggedValue) {
        // SAFETY: per this function's contract.
        unsafe {
            let Some(obj) = (*slot).as_heap_object() else {
                return;
            };
            let old_addr = obj as usize;
            debug_assert!(!self.view.in_from_space(old_addr));

            let new_addr = if self.view.in_new_space(old_addr) {
                let forwarded = *self.view.new_space_forwarding_slot(old_addr);
                debug_assert!(
                    self.view.in_old_space(forwarded)
                        || self.view.in_code_space(forwarded)
                        || self.view.in_from_space(forwarded)
                );
                forwarded
            } else if self.view.in_large_space(old_addr) {
                // Large objects do not move.
                old_addr
            } else {
                debug_assert!(self.view.in_paged_space(old_addr));
                get_forwarding_address(old_addr)
            };

            *slot = TaggedValue(new_addr);
            if self.verbose {
                tracing::debug!(
                    target: "gc",
                    slot = slot as usize,
                    from = old_addr,
                    to = new_addr,
                    "update"
                );
            }
        }
    }
}

impl ObjectVisitor for UpdatingVisitor<'_> {
    fn visit_pointer(&mut self, slot: *mut TaggedValue) {
        // SAFETY: visitors only receive live slots.
        unsafe { self.update_pointer(slot) };
    }

    fn visit_code_target(&mut self, slot: *mut usize) {
        // The marker switched every live code object's call sites to object
        // form before a compacting collection reaches this phase.
        let _ = slot;
        unreachable!("address-form code target while updating pointers");
    }
}

/// Update one live paged-space object: re-encode its map word against the
/// map's forwarded address and rewrite its body pointers.  Returns the
/// object's size.
///
/// # Safety
/// `obj` must be a live paged-space object in its encoded state.
pub(crate) unsafe fn update_pointers_in_paged_object(
    obj: *mut HeapObject,
    visitor: &mut UpdatingVisitor<'_>,
) -> usize {
    // SAFETY: per this function's contract.
    unsafe {
        let encoding = (*obj).map_word();
        let map_addr = visitor.view.decode_map_address(encoding);
        debug_assert!(visitor.view.in_map_space(map_addr));

        // The map's own map word is also encoded; only its plain fields are
        // readable, which is all sizing needs.
        let map = map_addr as *mut Map;
        let instance_type = (*map).instance_type();
        let size = object_size(obj, map);

        let new_map_addr = get_forwarding_address(map_addr);
        (*obj).set_map_word(MapWord::encode_forwarding(
            new_map_addr,
            encoding.decode_offset(),
        ));
        if visitor.verbose {
            tracing::debug!(
                target: "gc",
                object = obj as usize,
                from = map_addr,
                to = new_map_addr,
                "update map"
            );
        }

        iterate_body(obj, instance_type, size, visitor);
        size
    }
}

/// Update one object whose map word is still a plain pointer (new-space and
/// large objects): point it at the map's forwarded address and rewrite the
/// body.  Returns the object's size.
///
/// # Safety
/// `obj` must be live with a normal map word referencing an encoded map.
pub(crate) unsafe fn update_pointers_in_young_object(
    obj: *mut HeapObject,
    visitor: &mut UpdatingVisitor<'_>,
) -> usize {
    // SAFETY: per this function's contract.
    unsafe {
        let old_map = (*obj).map();
        debug_assert!(visitor.view.in_map_space(old_map as usize));

        // Size must come from the old map: map objects have not moved yet.
        let instance_type = (*old_map).instance_type();
        let size = object_size(obj, old_map);

        let forwarded = get_forwarding_address(old_map as usize);
        (*obj).set_map(forwarded as *mut Map);

        iterate_body(obj, instance_type, size, visitor);
        size
    }
}

impl MarkCompactCollector<'_> {
    /// Phase 4a-2: rewrite every stored pointer to a forwarded address.
    ///
    /// # Safety
    /// Encoding must have completed; called only in [`collect`] order.
    pub(crate) unsafe fn update_pointers(&mut self) {
        debug_assert_eq!(self.state, CollectorState::EncodeForwardingAddresses);
        self.state = CollectorState::UpdatePointers;

        let root_slots = self.heap.all_root_slots();
        let handle_slots = self.handles.strong_root_slots();
        let weak_slots = self.handles.weak_root_slots();

        let MarkCompactCollector {
            heap, view, flags, ..
        } = self;
        let heap: &Heap = &**heap;
        let view: &HeapView = &*view;
        let mut visitor = UpdatingVisitor {
            view,
            verbose: flags.gc_verbose,
        };

        // Roots first: strong roots, the symbol table, strong handles, and
        // the weak handles the marker promoted to strong.
        for slot in root_slots.into_iter().chain(handle_slots).chain(weak_slots) {
            visitor.visit_pointer(slot);
        }

        // SAFETY: every space is in its encoded state per this function's
        // contract.
        let (live_maps, live_olds, live_codes, live_news) = unsafe {
            let live_maps = iterate_live_objects_in_paged_space(&heap.map_space, |obj| {
                update_pointers_in_paged_object(obj, &mut visitor)
            });
            let live_olds = iterate_live_objects_in_paged_space(&heap.old_space, |obj| {
                update_pointers_in_paged_object(obj, &mut visitor)
            });
            let live_codes = iterate_live_objects_in_paged_space(&heap.code_space, |obj| {
                update_pointers_in_paged_object(obj, &mut visitor)
            });
            let live_news = iterate_live_objects_in_range(
                heap.new_space.bottom(),
                heap.new_space.top(),
                |obj| update_pointers_in_young_object(obj, &mut visitor),
            );
            // Large objects do not move; only their map words and bodies
            // need updating.
            for addr in heap.lo_space.object_addresses() {
                update_pointers_in_young_object(HeapObject::from_address(addr), &mut visitor);
            }
            (live_maps, live_olds, live_codes, live_news)
        };

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
