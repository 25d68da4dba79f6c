//! Phase 2: tracing and marking live objects.
//!
//! The traversal is tri-color with a physical encoding in the map word:
//! white objects have the mark bit clear; gray objects are marked and either
//! on the marking stack or flagged overflowed; black objects are marked with
//! neither gray condition.
//!
//! The marking stack is a bounded array living in the inactive semi-space.
//! When it fills, newly reached objects are colored gray by setting their
//! overflow bit instead of being pushed.  After the stack drains, the heap
//! is rescanned for overflowed objects, which are pushed back (clearing the
//! bit) and processed; this repeats until a pass finds the stack empty and
//! the overflow flag clear.

use crate::gc::collector::{CollectorState, MarkCompactCollector};
use crate::gc::tracer::GcTracer;
use crate::handles::GlobalHandles;
use crate::heap::page::POINTER_SIZE;
use crate::heap::paged_space::PagedSpace;
use crate::heap::{Heap, HeapView};
use crate::objects::array::SymbolTable;
use crate::objects::code::{clear_ic_at, Code};
use crate::objects::heap_object::HeapObject;
use crate::objects::map::{InstanceType, Map};
use crate::objects::string::ConsString;
use crate::objects::tagged::TaggedValue;
use crate::objects::visit::ObjectVisitor;
use crate::objects::{iterate_body, object_size};

/// Pointer ranges at least this long are marked by direct recursion when
/// stack headroom allows, avoiding a stack push per element.
const MIN_RANGE_FOR_MARKING_RECURSION: usize = 64;

/// Recursion budget for the direct-marking fast path.  Purely a heuristic
/// stand-in for a stack-limit probe; correctness never depends on it.
const MAX_MARKING_RECURSION_DEPTH: usize = 64;

/// The bounded marking work list, laid out over the inactive semi-space.
///
/// Overflow is an expected condition, not an error: it switches the marker
/// into overflow-bit coloring until a heap rescan drains the backlog.
pub(crate) struct MarkingStack {
    low: usize,
    top: usize,
    high: usize,
    overflowed: bool,
    overflow_events: usize,
}

impl MarkingStack {
    /// A zero-capacity stack for the collector's idle state.
    pub(crate) fn detached() -> Self {
        Self {
            low: 0,
            top: 0,
            high: 0,
            overflowed: false,
            overflow_events: 0,
        }
    }

    /// Lay the stack over `[low, high)`.
    ///
    /// The backing range must hold one pointer per live object in the worst
    /// case; the inactive semi-space satisfies this whenever live young
    /// bytes dominate, and overflow coloring covers the remainder.
    pub(crate) fn new(low: usize, high: usize) -> Self {
        debug_assert!(low <= high);
        debug_assert!(low % POINTER_SIZE == 0 && high % POINTER_SIZE == 0);
        Self {
            low,
            top: low,
            high,
            overflowed: false,
            overflow_events: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.top <= self.low
    }

    pub(crate) fn is_full(&self) -> bool {
        self.top >= self.high
    }

    /// Push a gray object.
    ///
    /// # Safety
    /// The stack must have been laid over writable scratch storage and must
    /// not be full.
    pub(crate) unsafe fn push(&mut self, obj: *mut HeapObject) {
        debug_assert!(!self.is_full());
        // SAFETY: top < high and the backing range is writable scratch.
        unsafe { *(self.top as *mut *mut HeapObject) = obj };
        self.top += POINTER_SIZE;
    }

    /// Pop a gray object, or `None` when the stack is empty.
    pub(crate) fn pop(&mut self) -> Option<*mut HeapObject> {
        if self.is_empty() {
            return None;
        }
        self.top -= POINTER_SIZE;
        // SAFETY: the slot below the old top was written by push.
        Some(unsafe { *(self.top as *const *mut HeapObject) })
    }

    pub(crate) fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Enter overflow mode (idempotent per episode).
    pub(crate) fn set_overflowed(&mut self) {
        if !self.overflowed {
            self.overflowed = true;
            self.overflow_events += 1;
        }
    }

    pub(crate) fn clear_overflowed(&mut self) {
        self.overflowed = false;
    }

    /// Number of distinct overflow episodes since creation.
    pub(crate) fn overflow_events(&self) -> usize {
        self.overflow_events
    }
}

/// Size of an object whose map word may carry mark or overflow bits.
///
/// # Safety
/// `obj` must carry a normal (non-encoded) map word referencing a live map.
pub(crate) unsafe fn object_size_ignoring_marks(obj: *mut HeapObject) -> usize {
    // to_map masks both flag bits, so a marked or overflowed word still
    // yields the real map.
    // SAFETY: per this function's contract.
    unsafe { object_size(obj, (*obj).map_word().to_map()) }
}

/// The marking visitor: colors everything reachable.
pub(crate) struct MarkingVisitor<'a> {
    pub(crate) stack: &'a mut MarkingStack,
    pub(crate) tracer: &'a mut GcTracer,
    view: &'a HeapView,
    cleanup_ics: bool,
    cleanup_map_caches: bool,
    compacting: bool,
    depth: usize,
}

impl<'a> MarkingVisitor<'a> {
    pub(crate) fn new(
        stack: &'a mut MarkingStack,
        tracer: &'a mut GcTracer,
        view: &'a HeapView,
        cleanup_ics: bool,
        cleanup_map_caches: bool,
        compacting: bool,
    ) -> Self {
        Self {
            stack,
            tracer,
            view,
            cleanup_ics,
            cleanup_map_caches,
            compacting,
            depth: 0,
        }
    }

    /// Color `obj` gray if it is still white.
    ///
    /// # Safety
    /// `obj` must be a live heap object with a normal map word.
    pub(crate) unsafe fn mark_object(&mut self, obj: *mut HeapObject) {
        // SAFETY: per this function's contract.
        unsafe {
            if (*obj).is_marked() {
                return;
            }
            self.mark_unmarked_object(obj);
        }
    }

    /// # Safety
    /// As for [`mark_object`][Self::mark_object]; `obj` must be white.
    unsafe fn mark_unmarked_object(&mut self, obj: *mut HeapObject) {
        // SAFETY: per this function's contract.
        unsafe {
            debug_assert!(!(*obj).is_marked());
            self.note_unmarked_object(obj);
            if self.stack.is_full() {
                self.stack.set_overflowed();
            }
            if self.stack.overflowed() {
                // Gray via the overflow bit; a rescan will re-queue it.
                (*obj).set_overflow();
            } else {
                self.stack.push(obj);
            }
        }
    }

    /// Shared bookkeeping for both the push path and the recursive fast
    /// path: counters, map code-cache eviction, and the mark bit itself.
    ///
    /// # Safety
    /// `obj` must be a live, white heap object with a normal map word.
    unsafe fn note_unmarked_object(&mut self, obj: *mut HeapObject) {
        // SAFETY: per this function's contract.
        unsafe {
            let instance_type = (*(*obj).map()).instance_type();
            if instance_type == InstanceType::JsGlobalObject {
                self.tracer.counters.global_objects += 1;
            }
            if self.cleanup_map_caches && instance_type == InstanceType::Map {
                (*(obj as *mut Map)).clear_code_cache();
            }
            (*obj).set_mark();
            self.tracer.increment_marked_count();
        }
    }

    /// # Safety
    /// `slot` must be a live tagged slot.
    unsafe fn mark_object_by_pointer(&mut self, slot: *mut TaggedValue) {
        // SAFETY: per this function's contract.
        unsafe {
            let Some(mut obj) = (*slot).as_heap_object() else {
                return;
            };

            // Shortcut: a cons whose right side is the canonical empty
            // string is its left side.  The rewrite is skipped when it would
            // move a new-space reference into a non-new-space slot, which
            // would need a remembered-set update this path cannot perform.
            let map = (*obj).map_word().to_map();
            if (*map).instance_type() == InstanceType::ConsString {
                let cons = obj as *mut ConsString;
                if (*cons).second() == self.view.empty_string {
                    if let Some(first_obj) = (*cons).first().as_heap_object() {
                        if self.view.in_new_space(obj as usize)
                            || !self.view.in_new_space(first_obj as usize)
                        {
                            *slot = (*cons).first();
                            obj = first_obj;
                        }
                    }
                }
            }

            self.mark_object(obj);
        }
    }

    /// Mark every white object referenced from `[start, end)` by direct
    /// recursion.  Returns `false` without visiting anything when the
    /// recursion budget is exhausted.
    ///
    /// # Safety
    /// The range must consist of live tagged slots.
    unsafe fn visit_unmarked_objects(
        &mut self,
        start: *mut TaggedValue,
        end: *mut TaggedValue,
    ) -> bool {
        if self.depth >= MAX_MARKING_RECURSION_DEPTH {
            return false;
        }
        let mut slot = start;
        while slot < end {
            // SAFETY: slot stays within the caller-provided live range.
            unsafe {
                if let Some(obj) = (*slot).as_heap_object() {
                    if !(*obj).is_marked() {
                        self.visit_unmarked_object(obj);
                    }
                }
                slot = slot.add(1);
            }
        }
        true
    }

    /// Blacken `obj` immediately, recursing into its body.
    ///
    /// # Safety
    /// `obj` must be a live, white heap object.
    unsafe fn visit_unmarked_object(&mut self, obj: *mut HeapObject) {
        // SAFETY: per this function's contract.
        unsafe {
            let map = (*obj).map();
            self.note_unmarked_object(obj);
            self.mark_object(map as *mut HeapObject);
            let size = object_size(obj, map);
            self.depth += 1;
            iterate_body(obj, (*map).instance_type(), size, self);
            self.depth -= 1;
        }
    }
}

impl ObjectVisitor for MarkingVisitor<'_> {
    fn visit_pointer(&mut self, slot: *mut TaggedValue) {
        // SAFETY: visitors only receive live slots.
        unsafe { self.mark_object_by_pointer(slot) };
    }

    fn visit_pointer_range(&mut self, start: *mut TaggedValue, end: *mut TaggedValue) {
        let len = (end as usize - start as usize) / POINTER_SIZE;
        if len >= MIN_RANGE_FOR_MARKING_RECURSION {
            // SAFETY: visitors only receive live slot ranges.
            if unsafe { self.visit_unmarked_objects(start, end) } {
                return;
            }
            // Out of recursion headroom; fall back to per-slot marking.
        }
        let mut slot = start;
        while slot < end {
            self.visit_pointer(slot);
            // SAFETY: slot stays within the caller-provided range.
            slot = unsafe { slot.add(1) };
        }
    }

    fn visit_code_target(&mut self, slot: *mut usize) {
        // SAFETY: code bodies hand out live call-site slots in address form.
        unsafe {
            let target = *slot;
            let code = Code::from_entry(target);
            if self.cleanup_ics && (*code).is_ic_stub() {
                // Drop the reference.  The generic stub the site now calls is
                // kept alive through the canonical roots, not through here.
                clear_ic_at(slot, self.view.generic_ic_entry);
            } else {
                self.mark_object(code as *mut HeapObject);
            }
            if self.compacting {
                // Switch the call site to object form so pointer updating
                // relocates it like any other reference.
                let code = Code::from_entry(*slot);
                *slot = code as usize;
            }
        }
    }

    fn visit_debug_target(&mut self, slot: *mut usize) {
        // SAFETY: code bodies hand out live call-site slots in address form.
        unsafe {
            let code = Code::from_entry(*slot);
            self.mark_object(code as *mut HeapObject);
            if self.compacting {
                *slot = code as usize;
            }
        }
    }

    fn begin_code_iteration(&mut self, code: *mut Code) {
        // While marking, call-site targets are raw entry addresses.
        // SAFETY: code is a live object under iteration.
        debug_assert!(!unsafe { (*code).ic_targets_are_objects() });
        let _ = code;
    }

    fn end_code_iteration(&mut self, code: *mut Code) {
        if self.compacting {
            // SAFETY: code is a live object under iteration.
            unsafe { (*code).set_ic_targets_are_objects() };
        }
    }
}

/// Overwrites dead symbol-table entries with the canonical null and counts
/// the removals.
pub(crate) struct SymbolTableCleaner {
    null_value: TaggedValue,
    removed: usize,
}

impl SymbolTableCleaner {
    pub(crate) fn new(null_value: TaggedValue) -> Self {
        Self {
            null_value,
            removed: 0,
        }
    }

    pub(crate) fn pointers_removed(&self) -> usize {
        self.removed
    }
}

impl ObjectVisitor for SymbolTableCleaner {
    fn visit_pointer(&mut self, slot: *mut TaggedValue) {
        // SAFETY: the cleaner only receives live symbol-table slots.
        unsafe {
            if let Some(obj) = (*slot).as_heap_object() {
                if !(*obj).is_marked() {
                    *slot = self.null_value;
                    self.removed += 1;
                }
            }
        }
    }
}

/// `true` when a weak referent survives marking.  Non-reference values
/// (Smis, cleared slots) cannot die and always count as live.
fn weak_referent_is_live(value: TaggedValue) -> bool {
    match value.as_heap_object() {
        // SAFETY: weak handles reference live (possibly unmarked) objects
        // for the duration of the marking phase.
        Some(obj) => unsafe { (*obj).is_marked() },
        None => true,
    }
}

/// Drain the marking stack to a fixpoint, including overflow recovery.
///
/// # Safety
/// The heap must be in its marking-phase state: every marked object's map
/// word normal, the stack laid over the inactive semi-space.
unsafe fn process_marking_stack(visitor: &mut MarkingVisitor<'_>, heap: &Heap) {
    loop {
        while let Some(obj) = visitor.stack.pop() {
            // Removing a gray object from the stack blackens it.
            // SAFETY: the stack only holds marked, live objects.
            unsafe {
                debug_assert!(heap.contains(obj as usize));
                debug_assert!((*obj).is_marked() && !(*obj).is_overflowed());
                // The object is marked, so the original map pointer must be
                // recovered from under the flag bits to walk the body.
                let map = (*obj).map_word().to_map();
                visitor.mark_object(map as *mut HeapObject);
                let size = object_size(obj, map);
                iterate_body(obj, (*map).instance_type(), size, visitor);
            }
        }

        // The only gray objects left are overflowed ones in the heap.  If
        // there are any, refill the stack and continue; stop early whenever
        // refilling overflows the stack again.
        if !visitor.stack.overflowed() {
            return;
        }
        visitor.stack.clear_overflowed();
        // SAFETY: spaces are walkable during marking (all map words normal).
        unsafe {
            if !scan_overflowed_range(
                visitor.stack,
                heap.new_space.bottom(),
                heap.new_space.top(),
            ) {
                continue;
            }
            if !scan_overflowed_paged(visitor.stack, &heap.old_space) {
                continue;
            }
            if !scan_overflowed_paged(visitor.stack, &heap.code_space) {
                continue;
            }
            if !scan_overflowed_paged(visitor.stack, &heap.map_space) {
                continue;
            }
            for addr in heap.lo_space.object_addresses() {
                if !push_if_overflowed(visitor.stack, HeapObject::from_address(addr)) {
                    break;
                }
            }
        }
    }
}

/// Re-queue one overflowed object; `false` when the stack filled up again.
///
/// # Safety
/// `obj` must be a live object with a normal (possibly flagged) map word.
unsafe fn push_if_overflowed(stack: &mut MarkingStack, obj: *mut HeapObject) -> bool {
    // SAFETY: per this function's contract.
    unsafe {
        if !(*obj).is_overflowed() {
            return true;
        }
        debug_assert!((*obj).is_marked());
        if stack.is_full() {
            stack.set_overflowed();
            return false;
        }
        (*obj).clear_overflow();
        stack.push(obj);
        true
    }
}

/// Rescan `[start, end)` for overflowed objects.
///
/// # Safety
/// The range must be a walkable run of objects with normal map words.
unsafe fn scan_overflowed_range(stack: &mut MarkingStack, start: usize, end: usize) -> bool {
    let mut current = start;
    while current < end {
        let obj = HeapObject::from_address(current);
        // SAFETY: the range is walkable per this function's contract.
        unsafe {
            let size = object_size_ignoring_marks(obj);
            if !push_if_overflowed(stack, obj) {
                return false;
            }
            current += size;
        }
    }
    true
}

/// Rescan every page of a paged space for overflowed objects.
///
/// # Safety
/// As for [`scan_overflowed_range`].
unsafe fn scan_overflowed_paged(stack: &mut MarkingStack, space: &PagedSpace) -> bool {
    for &page in space.pages() {
        // SAFETY: pages in the chain are live and walkable.
        unsafe {
            if !scan_overflowed_range(stack, (*page).object_area_start(), (*page).allocation_top)
            {
                return false;
            }
        }
    }
    true
}

/// Propagate object-group reachability: any group with a marked member has
/// every member marked, then is consumed.
///
/// # Safety
/// Marking-phase heap state, as for [`process_marking_stack`].
unsafe fn mark_object_groups(visitor: &mut MarkingVisitor<'_>, handles: &mut GlobalHandles) {
    for index in 0..handles.group_count() {
        let Some(members) = handles.group_members(index) else {
            continue;
        };
        let group_marked = members.iter().any(|&id| {
            match handles.get(id).as_heap_object() {
                // SAFETY: handle referents are live during marking.
                Some(obj) => unsafe { (*obj).is_marked() },
                None => false,
            }
        });
        if !group_marked {
            continue;
        }
        // One member is reachable, so all members are.
        for &id in &members {
            if let Some(obj) = handles.get(id).as_heap_object() {
                // SAFETY: handle referents are live during marking.
                unsafe { visitor.mark_object(obj) };
            }
        }
        handles.destroy_group(index);
    }
}

/// Run group propagation to a fixpoint, draining the stack between passes.
///
/// # Safety
/// Marking-phase heap state, as for [`process_marking_stack`].
unsafe fn process_object_groups(
    visitor: &mut MarkingVisitor<'_>,
    handles: &mut GlobalHandles,
    heap: &Heap,
) {
    debug_assert!(visitor.stack.is_empty());
    let mut work_to_do = true;
    while work_to_do {
        // SAFETY: per this function's contract.
        unsafe {
            mark_object_groups(visitor, handles);
            work_to_do = !visitor.stack.is_empty();
            process_marking_stack(visitor, heap);
        }
    }
}

impl MarkCompactCollector<'_> {
    /// Phase 2: color every reachable object black.
    ///
    /// Root order: strong roots (canonical objects, registered globals,
    /// strong handles), the symbol table prefix (with the table itself
    /// marked black directly so its weak elements stay untraced), object
    /// groups to a fixpoint, then weak roots with a final group pass.
    ///
    /// # Safety
    /// Heap quiescent; called only from [`collect`][Self::collect] order.
    pub(crate) unsafe fn mark_live_objects(&mut self) {
        debug_assert_eq!(self.state, CollectorState::Prepare);
        self.state = CollectorState::MarkLiveObjects;

        let strong_slots = self.heap.strong_root_slots();
        // The inactive semi-space is unused between collections; it becomes
        // the marking stack for the duration of this phase.
        self.marking_stack = MarkingStack::new(
            self.heap.new_space.from_space_low(),
            self.heap.new_space.from_space_high(),
        );

        let MarkCompactCollector {
            heap,
            handles,
            tracer,
            flags,
            compacting,
            view,
            marking_stack,
            ..
        } = self;
        let heap: &Heap = &**heap;
        let handles: &mut GlobalHandles = &mut **handles;
        let tracer: &mut GcTracer = &mut **tracer;
        let mut visitor = MarkingVisitor::new(
            marking_stack,
            tracer,
            view,
            flags.cleanup_ics_at_gc,
            flags.cleanup_caches_in_maps_at_gc,
            *compacting,
        );

        // SAFETY: quiescent heap per this function's contract.
        unsafe {
            // Strong roots, including handle-registered ones.
            for slot in strong_slots {
                visitor.visit_pointer(slot);
            }
            for slot in handles.strong_root_slots() {
                visitor.visit_pointer(slot);
            }

            // The symbol table: its prefix is strong, the table itself is
            // marked black without a stack push so the element array is
            // never traced as strong references.
            let table = SymbolTable::cast(heap.symbol_table());
            let (prefix_start, prefix_end) = (*table).prefix_slots();
            visitor.visit_pointer_range(prefix_start, prefix_end);
            (*(table as *mut HeapObject)).set_mark();
            visitor.tracer.increment_marked_count();

            process_marking_stack(&mut visitor, heap);

            // Objects reachable from groups containing a marked member, to a
            // fixpoint.
            process_object_groups(&mut visitor, handles, heap);

            // Weak roots: referents already live are promoted to strong and
            // traced; the rest become pending.  Groups rerun against the
            // augmented liveness.
            handles.mark_weak_roots(weak_referent_is_live);
            for slot in handles.weak_root_slots() {
                visitor.visit_pointer(slot);
            }
            process_marking_stack(&mut visitor, heap);
            process_object_groups(&mut visitor, handles, heap);

            // Prune symbols only the table still references.
            let mut cleaner = SymbolTableCleaner::new(heap.null_value());
            let (elements_start, elements_end) = (*table).element_slots();
            cleaner.visit_pointer_range(elements_start, elements_end);
            (*table).elements_removed(cleaner.pointers_removed());
        }

        let overflow_events = visitor.stack.overflow_events();
        visitor.tracer.add_marking_stack_overflows(overflow_events);
        debug_assert!(!visitor.stack.overflowed());

        // A referent revived by the late group passes keeps its handle; the
        // rest fire callbacks in the finish phase.
        handles.revive_pending(weak_referent_is_live);
        handles.remove_object_groups();

        #[cfg(debug_assertions)]
        {
            // SAFETY: all map words are still normal right after marking.
            self.live_tally = unsafe { self.count_marked_live() };
        }
    }

    /// Count marked objects per space; the later phases' live walks must
    /// observe exactly these numbers.
    #[cfg(debug_assertions)]
    pub(crate) unsafe fn count_marked_live(&self) -> crate::gc::collector::LiveTally {
        // SAFETY: the caller guarantees walkable spaces with normal map words.
        unsafe {
            let mut tally = crate::gc::collector::LiveTally::default();
            tally.young =
                count_marked_in_range(self.heap.new_space.bottom(), self.heap.new_space.top());
            for (space, slot) in [
                (&self.heap.old_space, &mut tally.old),
                (&self.heap.code_space, &mut tally.code),
                (&self.heap.map_space, &mut tally.map),
            ] {
                for &page in space.pages() {
                    *slot +=
                        count_marked_in_range((*page).object_area_start(), (*page).allocation_top);
                }
            }
            tally.large = self
                .heap
                .lo_space
                .object_addresses()
                .iter()
                .filter(|&&addr| (*HeapObject::from_address(addr)).is_marked())
                .count();
            tally
        }
    }
}

#[cfg(debug_assertions)]
unsafe fn count_marked_in_range(start: usize, end: usize) -> usize {
    let mut count = 0;
    let mut current = start;
    while current < end {
        let obj = HeapObject::from_address(current);
        // SAFETY: the range is a walkable object run.
        unsafe {
            if (*obj).is_marked() {
                count += 1;
            }
            current += object_size_ignoring_marks(obj);
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_stack_push_pop_is_lifo() {
        let mut backing = vec![0usize; 8];
        let low = backing.as_mut_ptr() as usize;
        let mut stack = MarkingStack::new(low, low + 8 * POINTER_SIZE);
        let a = 0x1000 as *mut HeapObject;
        let b = 0x2000 as *mut HeapObject;
        // SAFETY: the stack is laid over the local backing buffer.
        unsafe {
            stack.push(a);
            stack.push(b);
        }
        assert_eq!(stack.pop(), Some(b));
        assert_eq!(stack.pop(), Some(a));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn marking_stack_reports_full_at_capacity() {
        let mut backing = vec![0usize; 2];
        let low = backing.as_mut_ptr() as usize;
        let mut stack = MarkingStack::new(low, low + 2 * POINTER_SIZE);
        assert!(!stack.is_full());
        // SAFETY: the stack is laid over the local backing buffer.
        unsafe {
            stack.push(0x10 as *mut HeapObject);
            stack.push(0x20 as *mut HeapObject);
        }
        assert!(stack.is_full());
    }

    #[test]
    fn overflow_episodes_are_counted_once_each() {
        let mut stack = MarkingStack::detached();
        stack.set_overflowed();
        stack.set_overflowed();
        assert_eq!(stack.overflow_events(), 1);
        stack.clear_overflowed();
        stack.set_overflowed();
        assert_eq!(stack.overflow_events(), 2);
    }
}
