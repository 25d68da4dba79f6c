//! The mark-compact collector: orchestration, phase sequencing, and the
//! compaction decision.

use crate::flags::CollectorFlags;
use crate::gc::marking::MarkingStack;
use crate::gc::tracer::GcTracer;
use crate::handles::GlobalHandles;
use crate::heap::{Heap, HeapView};

/// Old-generation fragmentation (in percent) above which a collection
/// compacts instead of sweeping in place.
const FRAGMENTATION_LIMIT: usize = 50;

/// Phase tracking for contract assertions.  Transitions follow
/// `Idle → Prepare → Mark → (Encode → Update → Relocate → Rebuild | Sweep)
/// → Idle`; anything else is a bug in the caller or the collector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CollectorState {
    Idle,
    Prepare,
    MarkLiveObjects,
    SweepSpaces,
    EncodeForwardingAddresses,
    UpdatePointers,
    RelocateObjects,
    RebuildRsets,
}

/// Debug-only tallies recorded at the end of marking and re-checked by the
/// later phases' live walks.
#[cfg(debug_assertions)]
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct LiveTally {
    pub young: usize,
    pub old: usize,
    pub code: usize,
    pub map: usize,
    pub large: usize,
}

/// A single stop-the-world mark-compact collection.
///
/// The collector borrows the heap, the handle registry and the tracer for
/// exactly one cycle; creating a second collector while one is running is
/// impossible by construction, which is the contract the phase state machine
/// additionally asserts.
///
/// # Example
///
/// ```ignore
/// let flags = CollectorFlags::default();
/// let mut tracer = GcTracer::new();
/// MarkCompactCollector::new(&mut heap, &mut handles, &mut tracer, &flags).collect();
/// ```
pub struct MarkCompactCollector<'h> {
    pub(crate) heap: &'h mut Heap,
    pub(crate) handles: &'h mut GlobalHandles,
    pub(crate) tracer: &'h mut GcTracer,
    pub(crate) flags: &'h CollectorFlags,
    /// Chosen in the prepare phase; drives branch 4a vs 4b.
    pub(crate) compacting: bool,
    pub(crate) state: CollectorState,
    /// Space-bounds snapshot for visitors; refreshed when space contents
    /// change shape (after the large-object sweep).
    pub(crate) view: HeapView,
    /// The marking work list, physically resident in the inactive
    /// semi-space; empty outside the marking phase.
    pub(crate) marking_stack: MarkingStack,
    #[cfg(debug_assertions)]
    pub(crate) live_tally: LiveTally,
}

impl<'h> MarkCompactCollector<'h> {
    pub fn new(
        heap: &'h mut Heap,
        handles: &'h mut GlobalHandles,
        tracer: &'h mut GcTracer,
        flags: &'h CollectorFlags,
    ) -> Self {
        let view = heap.view();
        Self {
            heap,
            handles,
            tracer,
            flags,
            compacting: false,
            state: CollectorState::Idle,
            view,
            marking_stack: MarkingStack::detached(),
            #[cfg(debug_assertions)]
            live_tally: LiveTally::default(),
        }
    }

    /// Run a full collection.
    ///
    /// # Safety
    /// The heap must be quiescent: no mutator runs concurrently, and every
    /// reachable object graph edge goes through tagged slots the visitors
    /// understand.
    pub unsafe fn collect(&mut self) {
        self.prepare();
        if self.compacting {
            self.tracer.set_is_compacting();
        }

        // SAFETY: quiescence per this function's contract.
        unsafe {
            self.mark_live_objects();
            self.sweep_large_object_space();

            if self.compacting {
                self.encode_forwarding_addresses();
                self.update_pointers();
                self.relocate_objects();
                self.rebuild_rsets();
            } else {
                self.sweep_spaces();
            }
        }

        self.finish();
        debug_assert_eq!(
            self.tracer.marked_count(),
            0,
            "every mark set must have been cleared"
        );
    }

    /// Choose compaction vs. sweep-only and reset per-space bookkeeping.
    pub(crate) fn prepare(&mut self) {
        assert_eq!(
            self.state,
            CollectorState::Idle,
            "a collection is already in progress"
        );
        self.state = CollectorState::Prepare;
        assert!(
            !(self.flags.always_compact && self.flags.never_compact),
            "always_compact and never_compact are mutually exclusive"
        );

        self.compacting = self.flags.always_compact;

        // Compact when the old generation is fragmented enough that
        // reclaiming waste and free blocks recovers real space, or on a
        // whole-heap collection (young objects are only promoted out of new
        // space while compacting).
        if !self.compacting {
            let recoverable = self.heap.old_space.waste()
                + self.heap.old_space.available_free()
                + self.heap.code_space.waste()
                + self.heap.code_space.available_free();
            let used = recoverable + self.heap.old_space.size() + self.heap.code_space.size();
            let fragmented = used > 0 && recoverable * 100 / used > FRAGMENTATION_LIMIT;
            if self.flags.gc_global || fragmented {
                self.compacting = true;
            }
        }
        if self.flags.never_compact {
            self.compacting = false;
        }

        self.heap.map_space.prepare_for_mark_compact(self.compacting);
        self.heap.old_space.prepare_for_mark_compact(self.compacting);
        self.heap.code_space.prepare_for_mark_compact(self.compacting);

        self.tracer.counters.global_objects = 0;
        self.view = self.heap.view();
        #[cfg(debug_assertions)]
        {
            self.live_tally = LiveTally::default();
        }
    }

    /// Free unmarked large objects and clear marks on the survivors.  Large
    /// objects never move.
    pub(crate) unsafe fn sweep_large_object_space(&mut self) {
        debug_assert_eq!(self.state, CollectorState::MarkLiveObjects);
        self.state = if self.compacting {
            CollectorState::EncodeForwardingAddresses
        } else {
            CollectorState::SweepSpaces
        };
        // SAFETY: between marking and encoding every map word is readable.
        let survivors = unsafe { self.heap.lo_space.free_unmarked_objects() };
        self.tracer.decrement_marked_count_by(survivors);
        #[cfg(debug_assertions)]
        debug_assert_eq!(survivors, self.live_tally.large);
        // Large-object ranges changed; visitors built after this point must
        // not classify freed storage as in-heap.
        self.view = self.heap.view();
    }

    /// Recompute the remembered sets wholesale after relocation committed.
    pub(crate) fn rebuild_rsets(&mut self) {
        debug_assert_eq!(self.state, CollectorState::RelocateObjects);
        self.state = CollectorState::RebuildRsets;
        self.heap.rebuild_rsets();
    }

    /// Invalidate caches keyed by object identity and fire weak callbacks.
    pub(crate) fn finish(&mut self) {
        debug_assert!(
            matches!(
                self.state,
                CollectorState::SweepSpaces | CollectorState::RebuildRsets
            ),
            "finish out of order: {:?}",
            self.state
        );
        self.state = CollectorState::Idle;
        // The stub cache is not traversed during collection; clear it so it
        // lazily rebuilds against the objects' new addresses.
        self.heap.stub_cache.clear();
        self.handles.process_pending_callbacks();
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::marking::object_size_ignoring_marks;
    use crate::heap::{HeapConfig, SpaceId};
    use crate::objects::array::FixedArray;
    use crate::objects::code::{
        Code, CodeFlags, RELOC_KIND_CODE_TARGET, RELOC_KIND_DEBUG_CALL,
    };
    use crate::objects::heap_object::HeapObject;
    use crate::objects::string::SeqString;
    use crate::objects::tagged::TaggedValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tv(addr: usize) -> TaggedValue {
        TaggedValue(addr)
    }

    fn run_collection(
        heap: &mut Heap,
        handles: &mut GlobalHandles,
        flags: &CollectorFlags,
    ) -> GcTracer {
        let mut tracer = GcTracer::new();
        // SAFETY: test heaps are quiescent and single-threaded.
        unsafe { MarkCompactCollector::new(heap, handles, &mut tracer, flags).collect() };
        tracer
    }

    fn sweep_flags() -> CollectorFlags {
        CollectorFlags {
            never_compact: true,
            ..CollectorFlags::default()
        }
    }

    fn compact_flags() -> CollectorFlags {
        CollectorFlags {
            always_compact: true,
            ..CollectorFlags::default()
        }
    }

    /// Walk every space asserting that no object carries a mark or overflow
    /// bit.
    fn assert_heap_clean(heap: &Heap) {
        // SAFETY: outside a collection every object run is walkable.
        unsafe {
            let mut check_range = |start: usize, end: usize| {
                let mut current = start;
                while current < end {
                    let obj = HeapObject::from_address(current);
                    assert!(!(*obj).is_marked(), "mark bit left set at {current:#x}");
                    assert!(
                        !(*obj).is_overflowed(),
                        "overflow bit left set at {current:#x}"
                    );
                    current += object_size_ignoring_marks(obj);
                }
            };
            check_range(heap.new_space.bottom(), heap.new_space.top());
            for space in [&heap.old_space, &heap.code_space, &heap.map_space] {
                for &page in space.pages() {
                    check_range((*page).object_area_start(), (*page).allocation_top);
                }
            }
            for addr in heap.lo_space.object_addresses() {
                let obj = HeapObject::from_address(addr);
                assert!(!(*obj).is_marked());
                assert!(!(*obj).is_overflowed());
            }
        }
    }

    // ── Orchestration basics ──────────────────────────────────────────────

    #[test]
    fn collecting_an_untouched_heap_is_a_noop() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();
        let old_size = heap.old_space.size();
        for _ in 0..2 {
            let tracer = run_collection(&mut heap, &mut handles, &sweep_flags());
            assert_eq!(tracer.marked_count(), 0);
            assert_eq!(heap.old_space.size(), old_size);
            assert_heap_clean(&heap);
        }
    }

    #[test]
    fn conflicting_compaction_flags_are_rejected() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();
        let mut tracer = GcTracer::new();
        let flags = CollectorFlags {
            always_compact: true,
            never_compact: true,
            ..CollectorFlags::default()
        };
        let mut collector =
            MarkCompactCollector::new(&mut heap, &mut handles, &mut tracer, &flags);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            collector.prepare();
        }));
        assert!(result.is_err());
    }

    #[test]
    fn gc_global_forces_the_compacting_branch() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();
        let flags = CollectorFlags {
            gc_global: true,
            ..CollectorFlags::default()
        };
        let tracer = run_collection(&mut heap, &mut handles, &flags);
        assert!(tracer.is_compacting());
    }

    #[test]
    fn finish_clears_the_stub_cache() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();
        heap.stub_cache
            .insert(heap.js_object_map() as usize, 0, tv(0x1234));
        run_collection(&mut heap, &mut handles, &sweep_flags());
        assert!(heap.stub_cache.is_empty());
    }

    #[test]
    fn marking_counts_live_global_objects() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();
        let map = heap.js_global_object_map();
        let global = heap.allocate_js_object(SpaceId::Old, map).unwrap();
        heap.add_global_root(tv(global as usize));
        let tracer = run_collection(&mut heap, &mut handles, &sweep_flags());
        assert_eq!(tracer.counters.global_objects, 1);
    }

    // ── S1: sweep-only small heap ─────────────────────────────────────────

    #[test]
    fn sweep_only_keeps_addresses_and_frees_the_dead_region() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let o1 = heap.allocate_fixed_array(SpaceId::Old, 0).unwrap() as usize; // 16
        let dead = heap.allocate_byte_array(SpaceId::Old, 32).unwrap() as usize; // 48
        let o2 = heap.allocate_fixed_array(SpaceId::Old, 2).unwrap() as usize; // 32
        let o3 = heap.allocate_fixed_array(SpaceId::Old, 0).unwrap() as usize; // 16
        let r1 = heap.add_global_root(tv(o1));
        let r2 = heap.add_global_root(tv(o2));
        let r3 = heap.add_global_root(tv(o3));

        // Fresh heap, fragmentation far below the limit: sweep-only branch.
        let tracer = run_collection(&mut heap, &mut handles, &CollectorFlags::default());
        assert!(!tracer.is_compacting());

        assert_eq!(heap.global_root(r1), tv(o1), "addresses must not change");
        assert_eq!(heap.global_root(r2), tv(o2));
        assert_eq!(heap.global_root(r3), tv(o3));
        assert_eq!(
            heap.old_space.available_free(),
            48,
            "exactly the dead region is freed"
        );
        assert_eq!(dead, o1 + 16, "the freed region sits between the survivors");
        assert_heap_clean(&heap);
    }

    // ── S2: compacting slide in map space ─────────────────────────────────

    #[test]
    fn compaction_slides_maps_over_the_dead_slot() {
        use crate::objects::map::{InstanceType, MAP_SIZE};
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let m1 = heap.allocate_map(InstanceType::JsObject, 24).unwrap() as usize;
        let m2 = heap.allocate_map(InstanceType::JsObject, 24).unwrap() as usize;
        let dead = heap.allocate_map(InstanceType::JsObject, 24).unwrap() as usize;
        let m3 = heap.allocate_map(InstanceType::JsObject, 24).unwrap() as usize;
        assert_eq!(m2, m1 + MAP_SIZE);
        assert_eq!(m3, m1 + 3 * MAP_SIZE);
        let r1 = heap.add_global_root(tv(m1));
        let r2 = heap.add_global_root(tv(m2));
        let r3 = heap.add_global_root(tv(m3));

        let size_before = heap.map_space.size();
        run_collection(&mut heap, &mut handles, &compact_flags());

        // The two low maps stay; the third slides into the dead slot.
        assert_eq!(heap.global_root(r1), tv(m1));
        assert_eq!(heap.global_root(r2), tv(m2));
        assert_eq!(heap.global_root(r3), tv(dead));
        assert_eq!(heap.map_space.size(), size_before - MAP_SIZE);
        assert_heap_clean(&heap);
    }

    // ── S3: promotion out of new space ────────────────────────────────────

    #[test]
    fn compaction_promotes_young_objects_to_old_space() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let young = heap.allocate_fixed_array(SpaceId::New, 1).unwrap() as usize; // 24
        let root = heap.add_global_root(tv(young));

        run_collection(&mut heap, &mut handles, &compact_flags());

        let promoted = heap.global_root(root).raw();
        assert_ne!(promoted, young);
        assert!(
            heap.old_space.contains(promoted),
            "promoted object must land in old space"
        );
        assert_eq!(heap.new_space.used(), 0, "no copy remains in new space");
        assert_eq!(
            heap.new_space.age_mark(),
            heap.new_space.bottom(),
            "the age mark resets to the flipped space's bottom"
        );
        // SAFETY: the promoted array is live.
        unsafe {
            assert_eq!((*(promoted as *mut FixedArray)).length(), 1);
        }
        assert_heap_clean(&heap);
    }

    #[test]
    fn promoted_strings_land_in_code_space() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let s = heap.allocate_seq_string(SpaceId::New, b"immutable").unwrap() as usize;
        let root = heap.add_global_root(tv(s));
        run_collection(&mut heap, &mut handles, &compact_flags());
        let moved = heap.global_root(root).raw();
        assert!(heap.code_space.contains(moved));
        // SAFETY: the promoted string is live.
        unsafe {
            let string = moved as *mut SeqString;
            let bytes = std::slice::from_raw_parts((*string).bytes(), (*string).length());
            assert_eq!(bytes, b"immutable");
        }
    }

    // ── S4: marking-stack overflow recovery ───────────────────────────────

    #[test]
    fn marking_stack_overflow_recovery_converges() {
        // An 8-entry marking stack (64-byte inactive semi-space) against a
        // 273-object fan-out tree forces repeated overflow episodes.
        let config = HeapConfig {
            semispace_size: 64,
            ..HeapConfig::default()
        };
        let mut heap = Heap::new(config).unwrap();
        let mut handles = GlobalHandles::new();

        let root_array = heap.allocate_fixed_array(SpaceId::Old, 16).unwrap();
        for i in 0..16 {
            let mid = heap.allocate_fixed_array(SpaceId::Old, 16).unwrap();
            for j in 0..16 {
                let leaf = heap.allocate_fixed_array(SpaceId::Old, 0).unwrap();
                // SAFETY: mid is live with 16 slots.
                unsafe { (*mid).set(j, tv(leaf as usize)) };
            }
            // SAFETY: root_array is live with 16 slots.
            unsafe { (*root_array).set(i, tv(mid as usize)) };
        }
        heap.add_global_root(tv(root_array as usize));

        let tracer = run_collection(&mut heap, &mut handles, &sweep_flags());
        assert!(
            tracer.marking_stack_overflows() >= 9,
            "expected repeated overflow recovery, got {}",
            tracer.marking_stack_overflows()
        );
        assert_eq!(
            heap.old_space.available_free(),
            0,
            "every object is reachable; nothing may be freed"
        );
        assert_heap_clean(&heap);
    }

    // ── S5: object-group reachability ─────────────────────────────────────

    #[test]
    fn object_groups_are_all_or_none_reachable() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let map = heap.js_object_map();
        let g1 = heap.allocate_js_object(SpaceId::Old, map).unwrap();
        let g2 = heap.allocate_js_object(SpaceId::Old, map).unwrap();
        let g3 = heap.allocate_js_object(SpaceId::Old, map).unwrap();
        // g1 has an edge to g3.
        // SAFETY: g1 is live with two fields.
        unsafe { (*g1).set_field(0, tv(g3 as usize)) };

        // Only g2 is strongly reachable.
        heap.add_global_root(tv(g2 as usize));
        let h1 = handles.create(tv(g1 as usize));
        let h2 = handles.create(tv(g2 as usize));
        let h3 = handles.create(tv(g3 as usize));
        handles.make_weak(h1, None);
        handles.make_weak(h3, None);
        handles.add_object_group(&[h1, h2, h3]);

        run_collection(&mut heap, &mut handles, &sweep_flags());

        assert_eq!(
            heap.old_space.available_free(),
            0,
            "the whole group must survive"
        );
        assert_eq!(handles.group_count(), 0, "groups are consumed by marking");
        assert!(!handles.is_pending(h1));
        assert!(!handles.is_pending(h3));
        assert_heap_clean(&heap);
    }

    #[test]
    fn strong_handles_track_relocated_objects() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let _dead = heap.allocate_byte_array(SpaceId::Old, 48).unwrap();
        let target = heap.allocate_fixed_array(SpaceId::Old, 0).unwrap() as usize;
        let handle = handles.create(tv(target));

        run_collection(&mut heap, &mut handles, &compact_flags());

        let moved = handles.get(handle).raw();
        assert_eq!(moved, target - 64, "the handle slot follows the slide");
        // SAFETY: the relocated array is live.
        unsafe {
            assert_eq!((*(moved as *mut FixedArray)).length(), 0);
        }
    }

    #[test]
    fn weak_handle_kept_by_an_object_group_stays_updated() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let map = heap.js_object_map();
        let kept = heap.allocate_js_object(SpaceId::Old, map).unwrap();
        let anchor = heap.allocate_js_object(SpaceId::Old, map).unwrap();
        heap.add_global_root(tv(anchor as usize));

        let weak = handles.create(tv(kept as usize));
        handles.make_weak(weak, None);
        let strong = handles.create(tv(anchor as usize));
        handles.add_object_group(&[weak, strong]);

        run_collection(&mut heap, &mut handles, &sweep_flags());
        assert!(!handles.is_pending(weak));
        assert_eq!(handles.get(weak), tv(kept as usize));
        assert_eq!(heap.old_space.available_free(), 0);
    }

    // ── S6: weak handle with a dead target ────────────────────────────────

    static WEAK_DEATHS: AtomicUsize = AtomicUsize::new(0);

    fn count_weak_death(_value: TaggedValue) {
        WEAK_DEATHS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn dead_weak_referent_fires_the_callback_and_clears_the_handle() {
        WEAK_DEATHS.store(0, Ordering::SeqCst);
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let map = heap.js_object_map();
        let x = heap.allocate_js_object(SpaceId::Old, map).unwrap();
        // SAFETY: x is live; its instance size covers the map's layout.
        let x_size = unsafe { (*map).instance_size() };
        let w = handles.create(tv(x as usize));
        handles.make_weak(w, Some(count_weak_death));

        run_collection(&mut heap, &mut handles, &sweep_flags());

        assert_eq!(WEAK_DEATHS.load(Ordering::SeqCst), 1);
        assert_eq!(handles.get(w), TaggedValue::zero());
        assert_eq!(
            heap.old_space.available_free(),
            x_size,
            "the dead referent's storage is reclaimed"
        );
    }

    // ── Laws ──────────────────────────────────────────────────────────────

    #[test]
    fn cons_with_empty_right_is_shortcut_to_its_left() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let left = heap.allocate_seq_string(SpaceId::Old, b"ab").unwrap() as usize;
        let empty = heap.empty_string();
        let cons = heap
            .allocate_cons_string(SpaceId::Old, tv(left), empty, 2)
            .unwrap() as usize;
        let root = heap.add_global_root(tv(cons));

        run_collection(&mut heap, &mut handles, &sweep_flags());

        assert_eq!(
            heap.global_root(root),
            tv(left),
            "the reference must bypass the cons node"
        );
        // The cons node itself became unreachable and was reclaimed.
        assert_eq!(heap.old_space.available_free(), 32);
    }

    #[test]
    fn cons_shortcut_skips_new_to_old_rewrites() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        // Old-space cons over a new-space left child: rewriting an old-space
        // slot to a young object would need a remembered-set update the
        // marker cannot do, so the reference must stay on the cons.
        let left = heap.allocate_seq_string(SpaceId::New, b"young").unwrap() as usize;
        let empty = heap.empty_string();
        let cons = heap
            .allocate_cons_string(SpaceId::Old, tv(left), empty, 5)
            .unwrap() as usize;
        let root = heap.add_global_root(tv(cons));

        run_collection(&mut heap, &mut handles, &sweep_flags());
        assert_eq!(heap.global_root(root), tv(cons), "shortcut must be skipped");
    }

    #[test]
    fn compaction_preserves_the_relative_order_of_live_objects() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let a = heap.allocate_fixed_array(SpaceId::Old, 1).unwrap() as usize; // 24
        let _d1 = heap.allocate_byte_array(SpaceId::Old, 32).unwrap(); // 48, dead
        let b = heap.allocate_fixed_array(SpaceId::Old, 3).unwrap() as usize; // 40
        let _d2 = heap.allocate_byte_array(SpaceId::Old, 8).unwrap(); // 24, dead
        let c = heap.allocate_fixed_array(SpaceId::Old, 0).unwrap() as usize; // 16
        let ra = heap.add_global_root(tv(a));
        let rb = heap.add_global_root(tv(b));
        let rc = heap.add_global_root(tv(c));

        run_collection(&mut heap, &mut handles, &compact_flags());

        let (na, nb, nc) = (
            heap.global_root(ra).raw(),
            heap.global_root(rb).raw(),
            heap.global_root(rc).raw(),
        );
        assert_eq!(na, a, "nothing dead precedes the first survivor");
        assert_eq!(nb, b - 48, "the second survivor slides over the first gap");
        assert_eq!(nc, c - 48 - 24, "the third slides over both gaps");
        assert!(na < nb && nb < nc);
        assert_heap_clean(&heap);
    }

    #[test]
    fn compaction_rewrites_interior_pointers() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let _dead = heap.allocate_byte_array(SpaceId::Old, 96).unwrap();
        let target = heap.allocate_fixed_array(SpaceId::Old, 0).unwrap() as usize;
        let holder = heap.allocate_fixed_array(SpaceId::Old, 1).unwrap();
        // SAFETY: holder is live with one slot.
        unsafe { (*holder).set(0, tv(target)) };
        let rh = heap.add_global_root(tv(holder as usize));
        let rt = heap.add_global_root(tv(target));

        run_collection(&mut heap, &mut handles, &compact_flags());

        let new_holder = heap.global_root(rh).raw() as *mut FixedArray;
        // SAFETY: the relocated holder is live.
        let interior = unsafe { (*new_holder).get(0) };
        assert_eq!(
            interior,
            heap.global_root(rt),
            "interior and root views of the target must agree"
        );
        assert_ne!(heap.global_root(rt).raw(), target, "the target moved");
    }

    // ── Symbol table cleaning ─────────────────────────────────────────────

    #[test]
    fn symbol_table_entries_are_weak() {
        use crate::objects::array::SymbolTable;
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let kept = heap.allocate_seq_string(SpaceId::Old, b"kept").unwrap() as usize;
        let dropped = heap.allocate_seq_string(SpaceId::Old, b"dropped").unwrap() as usize;
        let table = heap.symbol_table();
        // SAFETY: the table is live; slots 1 and 2 are element slots.
        unsafe {
            (*table).set(0, TaggedValue::from_smi(2));
            (*table).set(1, tv(kept));
            (*table).set(2, tv(dropped));
        }
        heap.add_global_root(tv(kept));

        run_collection(&mut heap, &mut handles, &sweep_flags());

        // SAFETY: the table is live.
        unsafe {
            assert_eq!((*table).get(1), tv(kept), "rooted symbol survives");
            assert_eq!(
                (*table).get(2),
                heap.null_value(),
                "unreferenced symbol is overwritten with null"
            );
            let st = SymbolTable::cast(table);
            assert_eq!((*st).live_symbols(), 1);
        }
    }

    // ── Code objects and inline caches ────────────────────────────────────

    #[test]
    fn compaction_relocates_code_and_patches_call_sites() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();
        let flags = CollectorFlags {
            always_compact: true,
            cleanup_ics_at_gc: false,
            ..CollectorFlags::default()
        };

        let dead = heap
            .allocate_code(SpaceId::Code, 32, &[], CodeFlags::empty())
            .unwrap();
        // SAFETY: dead is live until collection.
        let dead_size = unsafe { (*dead).size() };
        let target = heap
            .allocate_code(SpaceId::Code, 16, &[], CodeFlags::empty())
            .unwrap();
        let caller = heap
            .allocate_code(
                SpaceId::Code,
                16,
                &[RELOC_KIND_CODE_TARGET, RELOC_KIND_DEBUG_CALL],
                CodeFlags::empty(),
            )
            .unwrap();
        // SAFETY: caller has two relocation entries; target is live.
        unsafe {
            (*(*caller).reloc_entry(0)).target = (*target).entry();
            (*(*caller).reloc_entry(1)).target = (*target).entry();
        }
        let rc = heap.add_global_root(tv(caller as usize));

        run_collection(&mut heap, &mut handles, &flags);

        let new_caller = heap.global_root(rc).raw() as *mut Code;
        assert_eq!(
            new_caller as usize,
            target as usize, // caller slid down over the dead block
            "caller must slide into the dead code's storage by {dead_size} bytes"
        );
        // SAFETY: the relocated caller and its target are live.
        unsafe {
            assert!(!(*new_caller).ic_targets_are_objects());
            assert_eq!(
                (*new_caller).instruction_start(),
                (*new_caller).entry(),
                "the internal PC reference must track the move"
            );
            let patched = (*(*new_caller).reloc_entry(0)).target;
            let new_target = Code::from_entry(patched);
            assert_eq!(
                new_target as usize,
                dead as usize,
                "the target slid into the dead code's storage"
            );
            assert_eq!((*(*new_caller).reloc_entry(1)).target, patched);
        }
        assert_heap_clean(&heap);
    }

    #[test]
    fn ic_cleanup_drops_stub_references_during_marking() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut handles = GlobalHandles::new();

        let stub = heap
            .allocate_code(SpaceId::Code, 16, &[], CodeFlags::IC_STUB)
            .unwrap();
        // SAFETY: stub is live until collection.
        let stub_size = unsafe { (*stub).size() };
        let caller = heap
            .allocate_code(
                SpaceId::Code,
                16,
                &[RELOC_KIND_CODE_TARGET],
                CodeFlags::empty(),
            )
            .unwrap();
        // SAFETY: caller has one relocation entry; stub is live.
        unsafe { (*(*caller).reloc_entry(0)).target = (*stub).entry() };
        heap.add_global_root(tv(caller as usize));

        // Sweep-only keeps addresses stable so the cleared site is easy to
        // inspect.
        run_collection(&mut heap, &mut handles, &sweep_flags());

        // SAFETY: caller is live at an unchanged address.
        unsafe {
            let generic_entry = (*heap.generic_ic_stub()).entry();
            assert_eq!(
                (*(*caller).reloc_entry(0)).target,
                generic_entry,
                "the call site must be repointed at the generic stub"
            );
        }
        assert_eq!(
            heap.code_space.available_free(),
            stub_size,
            "the orphaned stub is reclaimed"
        );
    }

    // ── Remembered-set rebuild ────────────────────────────────────────────

    #[test]
    fn rset_rebuild_records_survivors_left_in_new_space() {
        use crate::heap::page::Page;
        // One old-space page, packed so the young survivor cannot promote.
        let config = HeapConfig {
            old_space_pages: 1,
            ..HeapConfig::default()
        };
        let mut heap = Heap::new(config).unwrap();
        let mut handles = GlobalHandles::new();

        let holder = heap.allocate_fixed_array(SpaceId::Old, 1).unwrap();
        let filler = heap.allocate_byte_array(SpaceId::Old, 7568).unwrap();
        heap.add_global_root(tv(holder as usize));
        heap.add_global_root(tv(filler as usize));

        let young = heap.allocate_fixed_array(SpaceId::New, 1).unwrap();
        // SAFETY: holder is live with one slot.
        unsafe { (*holder).set(0, tv(young as usize)) };

        run_collection(&mut heap, &mut handles, &compact_flags());

        // The survivor had nowhere to promote: it is still young.
        let new_holder = heap.global_root(0).raw() as *mut FixedArray;
        // SAFETY: the holder survived in old space.
        unsafe {
            let referent = (*new_holder).get(0).raw();
            assert!(
                heap.new_space.contains(referent),
                "young object must stay in new space when old space is full"
            );
            let slot = (*new_holder).slot(0) as usize;
            let page = Page::from_address(slot);
            assert!(
                (*page).is_rset_bit_set(slot),
                "the rebuilt remembered set must cover the old-to-new slot"
            );
        }
    }
}
