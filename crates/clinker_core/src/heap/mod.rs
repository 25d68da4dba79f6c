//! The managed heap: spaces, canonical roots, and collector support hooks.

/// The young generation's semi-space pair.
pub mod new_space;
/// Fixed-size pages and the per-page remembered set.
pub mod page;
/// Paged spaces (old, code, map) with free lists and the relocation arena.
pub mod paged_space;

/// The large-object space.
pub mod large_space;

use std::collections::HashMap;

use crate::error::HeapResult;
use crate::heap::large_space::LargeObjectSpace;
use crate::heap::new_space::NewSpace;
use crate::heap::page::{Page, POINTER_SIZE};
use crate::heap::paged_space::PagedSpace;
use crate::objects::array::{ByteArray, FixedArray, SYMBOL_TABLE_PREFIX_SIZE};
use crate::objects::code::{Code, CodeFlags};
use crate::objects::heap_object::{HeapObject, MapWord};
use crate::objects::map::{InstanceType, Map, MAP_SIZE};
use crate::objects::string::{ConsString, SeqString, CONS_STRING_SIZE};
use crate::objects::tagged::TaggedValue;
use crate::objects::{object_size, HeapNumber, JsObject, Oddball, HEAP_NUMBER_SIZE, ODDBALL_SIZE};

/// Identifies one of the heap's spaces.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpaceId {
    New,
    Old,
    Code,
    Map,
    Large,
}

/// Sizing knobs for a heap instance.
#[derive(Copy, Clone, Debug)]
pub struct HeapConfig {
    /// Bytes per semi-space half of the young generation.
    pub semispace_size: usize,
    pub old_space_pages: usize,
    pub code_space_pages: usize,
    pub map_space_pages: usize,
    /// Element slots in the symbol table (excluding the prefix).
    pub symbol_table_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            semispace_size: 64 * 1024,
            old_space_pages: 64,
            code_space_pages: 16,
            map_space_pages: 8,
            symbol_table_capacity: 32,
        }
    }
}

// Canonical root indices.  The symbol table is deliberately last: strong-root
// iteration stops before it because the collector treats the table specially.
const ROOT_META_MAP: usize = 0;
const ROOT_FIXED_ARRAY_MAP: usize = 1;
const ROOT_BYTE_ARRAY_MAP: usize = 2;
const ROOT_ONE_WORD_FILLER_MAP: usize = 3;
const ROOT_ODDBALL_MAP: usize = 4;
const ROOT_CODE_MAP: usize = 5;
const ROOT_HEAP_NUMBER_MAP: usize = 6;
const ROOT_SEQ_STRING_MAP: usize = 7;
const ROOT_CONS_STRING_MAP: usize = 8;
const ROOT_JS_OBJECT_MAP: usize = 9;
const ROOT_JS_GLOBAL_OBJECT_MAP: usize = 10;
const ROOT_NULL_VALUE: usize = 11;
const ROOT_EMPTY_STRING: usize = 12;
const ROOT_GENERIC_IC_STUB: usize = 13;
const ROOT_SYMBOL_TABLE: usize = 14;
const STRONG_ROOT_COUNT: usize = ROOT_SYMBOL_TABLE;
const ROOT_COUNT: usize = ROOT_SYMBOL_TABLE + 1;

/// A lookup cache keyed by object identity (map address, stub kind).
///
/// The cache is not traversed during collection; the collector clears it in
/// its finish phase so stale addresses can never be observed.
#[derive(Default)]
pub struct StubCache {
    entries: HashMap<(usize, u32), TaggedValue>,
}

impl StubCache {
    pub fn insert(&mut self, map_addr: usize, kind: u32, value: TaggedValue) {
        self.entries.insert((map_addr, kind), value);
    }

    pub fn lookup(&self, map_addr: usize, kind: u32) -> Option<TaggedValue> {
        self.entries.get(&(map_addr, kind)).copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An immutable snapshot of space bounds and page tables, copied out of the
/// heap so collector visitors can classify and translate addresses without
/// borrowing the heap itself.
#[derive(Clone)]
pub struct HeapView {
    new_low: usize,
    new_high: usize,
    from_low: usize,
    from_high: usize,
    lo_ranges: Vec<(usize, usize)>,
    old_pages: Vec<usize>,
    code_pages: Vec<usize>,
    map_pages: Vec<usize>,
    /// The canonical empty string, for the marker's cons shortcut.
    pub empty_string: TaggedValue,
    /// Entry point of the shared generic IC stub.
    pub generic_ic_entry: usize,
}

impl HeapView {
    pub fn in_new_space(&self, addr: usize) -> bool {
        (self.new_low..self.new_high).contains(&addr)
    }

    pub fn in_from_space(&self, addr: usize) -> bool {
        (self.from_low..self.from_high).contains(&addr)
    }

    pub fn in_large_space(&self, addr: usize) -> bool {
        self.lo_ranges
            .iter()
            .any(|&(base, end)| (base..end).contains(&addr))
    }

    pub fn in_old_space(&self, addr: usize) -> bool {
        self.old_pages.contains(&(Page::from_address(addr) as usize))
    }

    pub fn in_code_space(&self, addr: usize) -> bool {
        self.code_pages
            .contains(&(Page::from_address(addr) as usize))
    }

    pub fn in_map_space(&self, addr: usize) -> bool {
        self.map_pages.contains(&(Page::from_address(addr) as usize))
    }

    pub fn in_paged_space(&self, addr: usize) -> bool {
        self.in_old_space(addr) || self.in_code_space(addr) || self.in_map_space(addr)
    }

    /// Resolve a forwarding encoding's map location to an address.
    pub fn decode_map_address(&self, word: MapWord) -> usize {
        self.map_pages[word.decode_map_page_index()] + word.decode_map_page_offset()
    }

    /// The out-of-line forwarding slot for an active-half young object.
    pub fn new_space_forwarding_slot(&self, addr: usize) -> *mut usize {
        debug_assert!(self.in_new_space(addr));
        (self.from_low + (addr - self.new_low)) as *mut usize
    }
}

/// Promotion policy: immutable payloads go to code space, everything else to
/// old space.
pub fn target_space_for(instance_type: InstanceType) -> SpaceId {
    match instance_type {
        InstanceType::SeqString | InstanceType::HeapNumber => SpaceId::Code,
        _ => SpaceId::Old,
    }
}

/// The managed heap.
pub struct Heap {
    pub new_space: NewSpace,
    pub old_space: PagedSpace,
    pub code_space: PagedSpace,
    pub map_space: PagedSpace,
    pub lo_space: LargeObjectSpace,
    pub stub_cache: StubCache,
    roots: [TaggedValue; ROOT_COUNT],
    global_roots: Vec<TaggedValue>,
}

impl Heap {
    /// Create a heap and its canonical objects.
    pub fn new(config: HeapConfig) -> HeapResult<Heap> {
        assert!(config.map_space_pages <= MapWord::MAX_MAP_PAGES);
        let mut heap = Heap {
            new_space: NewSpace::new(config.semispace_size),
            old_space: PagedSpace::new("old", config.old_space_pages),
            code_space: PagedSpace::new("code", config.code_space_pages),
            map_space: PagedSpace::new("map", config.map_space_pages),
            lo_space: LargeObjectSpace::new(),
            stub_cache: StubCache::default(),
            roots: [TaggedValue::zero(); ROOT_COUNT],
            global_roots: Vec::new(),
        };
        heap.setup(config)?;
        Ok(heap)
    }

    fn setup(&mut self, config: HeapConfig) -> HeapResult<()> {
        // The meta map describes itself.
        let meta = self.allocate_object(SpaceId::Map, MAP_SIZE)? as *mut Map;
        // SAFETY: meta references MAP_SIZE fresh zeroed bytes.
        unsafe { Map::initialize(meta, meta, InstanceType::Map, MAP_SIZE as u32) };
        self.roots[ROOT_META_MAP] = TaggedValue(meta as usize);

        let canon = [
            (ROOT_FIXED_ARRAY_MAP, InstanceType::FixedArray, 0u32),
            (ROOT_BYTE_ARRAY_MAP, InstanceType::ByteArray, 0),
            (
                ROOT_ONE_WORD_FILLER_MAP,
                InstanceType::OneWordFiller,
                POINTER_SIZE as u32,
            ),
            (ROOT_ODDBALL_MAP, InstanceType::Oddball, ODDBALL_SIZE as u32),
            (ROOT_CODE_MAP, InstanceType::Code, 0),
            (
                ROOT_HEAP_NUMBER_MAP,
                InstanceType::HeapNumber,
                HEAP_NUMBER_SIZE as u32,
            ),
            (ROOT_SEQ_STRING_MAP, InstanceType::SeqString, 0),
            (
                ROOT_CONS_STRING_MAP,
                InstanceType::ConsString,
                CONS_STRING_SIZE as u32,
            ),
        ];
        for (root, ty, size) in canon {
            let map = self.allocate_map(ty, size)?;
            self.roots[root] = TaggedValue(map as usize);
        }
        // Object maps get a default two-field shape; callers needing other
        // shapes allocate their own maps.
        let js_object_map =
            self.allocate_map(InstanceType::JsObject, (POINTER_SIZE * 3) as u32)?;
        self.roots[ROOT_JS_OBJECT_MAP] = TaggedValue(js_object_map as usize);
        let js_global_map =
            self.allocate_map(InstanceType::JsGlobalObject, (POINTER_SIZE * 3) as u32)?;
        self.roots[ROOT_JS_GLOBAL_OBJECT_MAP] = TaggedValue(js_global_map as usize);

        let one_word = self.one_word_filler_map();
        let byte_array = self.byte_array_map();
        self.old_space.set_filler_maps(one_word, byte_array);
        self.code_space.set_filler_maps(one_word, byte_array);
        self.map_space.set_filler_maps(one_word, byte_array);

        // Canonical null.
        let null = self.allocate_object(SpaceId::Old, ODDBALL_SIZE)?;
        // SAFETY: null references fresh zeroed storage; the oddball map is live.
        unsafe {
            (*HeapObject::from_address(null)).set_map(self.oddball_map());
            (*(null as *mut Oddball)).set_kind(0);
        }
        self.roots[ROOT_NULL_VALUE] = TaggedValue(null);

        // Canonical empty string.
        let empty = self.allocate_seq_string(SpaceId::Old, b"")?;
        self.roots[ROOT_EMPTY_STRING] = TaggedValue(empty as usize);

        // The shared generic IC stub cleared call sites point at.
        let stub = self.allocate_code(SpaceId::Code, 8, &[], CodeFlags::empty())?;
        self.roots[ROOT_GENERIC_IC_STUB] = TaggedValue(stub as usize);

        // The symbol table: prefix counter plus weak element slots.
        let table = self.allocate_fixed_array(
            SpaceId::Old,
            SYMBOL_TABLE_PREFIX_SIZE + config.symbol_table_capacity,
        )?;
        // SAFETY: table is fully initialised by allocate_fixed_array.
        unsafe { (*table).set(0, TaggedValue::from_smi(0)) };
        self.roots[ROOT_SYMBOL_TABLE] = TaggedValue(table as usize);
        Ok(())
    }

    // ── Canonical object accessors ────────────────────────────────────────

    pub fn meta_map(&self) -> *mut Map {
        self.roots[ROOT_META_MAP].raw() as *mut Map
    }

    pub fn fixed_array_map(&self) -> *mut Map {
        self.roots[ROOT_FIXED_ARRAY_MAP].raw() as *mut Map
    }

    pub fn byte_array_map(&self) -> *mut Map {
        self.roots[ROOT_BYTE_ARRAY_MAP].raw() as *mut Map
    }

    pub fn one_word_filler_map(&self) -> *mut Map {
        self.roots[ROOT_ONE_WORD_FILLER_MAP].raw() as *mut Map
    }

    pub fn oddball_map(&self) -> *mut Map {
        self.roots[ROOT_ODDBALL_MAP].raw() as *mut Map
    }

    pub fn code_map(&self) -> *mut Map {
        self.roots[ROOT_CODE_MAP].raw() as *mut Map
    }

    pub fn heap_number_map(&self) -> *mut Map {
        self.roots[ROOT_HEAP_NUMBER_MAP].raw() as *mut Map
    }

    pub fn seq_string_map(&self) -> *mut Map {
        self.roots[ROOT_SEQ_STRING_MAP].raw() as *mut Map
    }

    pub fn cons_string_map(&self) -> *mut Map {
        self.roots[ROOT_CONS_STRING_MAP].raw() as *mut Map
    }

    pub fn js_object_map(&self) -> *mut Map {
        self.roots[ROOT_JS_OBJECT_MAP].raw() as *mut Map
    }

    pub fn js_global_object_map(&self) -> *mut Map {
        self.roots[ROOT_JS_GLOBAL_OBJECT_MAP].raw() as *mut Map
    }

    pub fn null_value(&self) -> TaggedValue {
        self.roots[ROOT_NULL_VALUE]
    }

    pub fn empty_string(&self) -> TaggedValue {
        self.roots[ROOT_EMPTY_STRING]
    }

    pub fn generic_ic_stub(&self) -> *mut Code {
        self.roots[ROOT_GENERIC_IC_STUB].raw() as *mut Code
    }

    pub fn symbol_table(&self) -> *mut FixedArray {
        self.roots[ROOT_SYMBOL_TABLE].raw() as *mut FixedArray
    }

    // ── Allocation ────────────────────────────────────────────────────────

    /// Allocate `size` zeroed bytes in the given space.
    pub fn allocate_object(&mut self, space: SpaceId, size: usize) -> HeapResult<usize> {
        let addr = match space {
            SpaceId::New => self.new_space.allocate_raw(size)?,
            SpaceId::Old => self.old_space.allocate_raw(size)?,
            SpaceId::Code => self.code_space.allocate_raw(size)?,
            SpaceId::Map => self.map_space.allocate_raw(size)?,
            SpaceId::Large => self.lo_space.allocate(size)?,
        };
        // SAFETY: addr references `size` fresh, exclusively owned bytes.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
        Ok(addr)
    }

    /// Allocate and initialise a map in map space.
    pub fn allocate_map(
        &mut self,
        instance_type: InstanceType,
        instance_size: u32,
    ) -> HeapResult<*mut Map> {
        let addr = self.allocate_object(SpaceId::Map, MAP_SIZE)?;
        let map = addr as *mut Map;
        // SAFETY: addr references MAP_SIZE fresh zeroed bytes; the meta map
        // is live.
        unsafe { Map::initialize(map, self.meta_map(), instance_type, instance_size) };
        Ok(map)
    }

    /// Allocate a fixed array with every slot set to the canonical null.
    pub fn allocate_fixed_array(
        &mut self,
        space: SpaceId,
        length: usize,
    ) -> HeapResult<*mut FixedArray> {
        let addr = self.allocate_object(space, FixedArray::size_for(length))?;
        let array = addr as *mut FixedArray;
        // SAFETY: addr references fresh zeroed storage of the right size.
        unsafe {
            (*(addr as *mut HeapObject)).set_map(self.fixed_array_map());
            (*array).set_length(length);
            for i in 0..length {
                (*array).set(i, self.null_value());
            }
        }
        Ok(array)
    }

    pub fn allocate_byte_array(
        &mut self,
        space: SpaceId,
        length: usize,
    ) -> HeapResult<*mut ByteArray> {
        let addr = self.allocate_object(space, ByteArray::size_for(length))?;
        let array = addr as *mut ByteArray;
        // SAFETY: addr references fresh zeroed storage of the right size.
        unsafe {
            (*(addr as *mut HeapObject)).set_map(self.byte_array_map());
            (*array).set_length(length);
        }
        Ok(array)
    }

    pub fn allocate_seq_string(
        &mut self,
        space: SpaceId,
        content: &[u8],
    ) -> HeapResult<*mut SeqString> {
        let addr = self.allocate_object(space, SeqString::size_for(content.len()))?;
        let string = addr as *mut SeqString;
        // SAFETY: addr references fresh zeroed storage of the right size.
        unsafe {
            (*(addr as *mut HeapObject)).set_map(self.seq_string_map());
            (*string).set_length(content.len());
            (*string).write_bytes(content);
        }
        Ok(string)
    }

    pub fn allocate_cons_string(
        &mut self,
        space: SpaceId,
        first: TaggedValue,
        second: TaggedValue,
        length: usize,
    ) -> HeapResult<*mut ConsString> {
        let addr = self.allocate_object(space, CONS_STRING_SIZE)?;
        let cons = addr as *mut ConsString;
        // SAFETY: addr references fresh zeroed storage of the right size.
        unsafe {
            (*(addr as *mut HeapObject)).set_map(self.cons_string_map());
            (*cons).set_length(length);
            (*cons).set_first(first);
            (*cons).set_second(second);
        }
        Ok(cons)
    }

    pub fn allocate_heap_number(
        &mut self,
        space: SpaceId,
        value: f64,
    ) -> HeapResult<*mut HeapNumber> {
        let addr = self.allocate_object(space, HEAP_NUMBER_SIZE)?;
        let number = addr as *mut HeapNumber;
        // SAFETY: addr references fresh zeroed storage of the right size.
        unsafe {
            (*(addr as *mut HeapObject)).set_map(self.heap_number_map());
            (*number).set_value(value);
        }
        Ok(number)
    }

    /// Allocate an object instance of `map`, all fields null.
    pub fn allocate_js_object(
        &mut self,
        space: SpaceId,
        map: *mut Map,
    ) -> HeapResult<*mut JsObject> {
        // SAFETY: caller provides a live map.
        let size = unsafe { (*map).instance_size() };
        let addr = self.allocate_object(space, size)?;
        let object = addr as *mut JsObject;
        // SAFETY: addr references fresh zeroed storage of `size` bytes.
        unsafe {
            (*(addr as *mut HeapObject)).set_map(map);
            for i in 0..JsObject::field_count(size) {
                (*object).set_field(i, self.null_value());
            }
        }
        Ok(object)
    }

    /// Allocate a code object; relocation entries get the given kinds with
    /// zeroed targets for the caller to fill in.
    pub fn allocate_code(
        &mut self,
        space: SpaceId,
        body_size: u32,
        reloc_kinds: &[usize],
        flags: CodeFlags,
    ) -> HeapResult<*mut Code> {
        debug_assert!(matches!(space, SpaceId::Code | SpaceId::Large));
        let size = Code::size_for(body_size, reloc_kinds.len() as u32);
        let addr = self.allocate_object(space, size)?;
        let code = addr as *mut Code;
        // SAFETY: addr references fresh zeroed storage of the right size.
        unsafe {
            (*(addr as *mut HeapObject)).set_map(self.code_map());
            Code::initialize(code, body_size, reloc_kinds.len() as u32, flags);
            for (i, &kind) in reloc_kinds.iter().enumerate() {
                (*(*code).reloc_entry(i)).kind = kind;
            }
        }
        Ok(code)
    }

    // ── Space classification ──────────────────────────────────────────────

    pub fn contains(&self, addr: usize) -> bool {
        self.new_space.contains(addr)
            || self.old_space.contains(addr)
            || self.code_space.contains(addr)
            || self.map_space.contains(addr)
            || self.lo_space.contains(addr)
    }

    /// Promotion target for a young object.
    ///
    /// # Safety
    /// `obj` must carry a valid (unmarked) map word.
    pub unsafe fn target_space(&self, obj: *mut HeapObject) -> SpaceId {
        // SAFETY: per this function's contract.
        target_space_for(unsafe { (*(*obj).map()).instance_type() })
    }

    // ── Roots ─────────────────────────────────────────────────────────────

    /// Register an extra strong root slot; returns its index.
    pub fn add_global_root(&mut self, value: TaggedValue) -> usize {
        self.global_roots.push(value);
        self.global_roots.len() - 1
    }

    pub fn global_root(&self, index: usize) -> TaggedValue {
        self.global_roots[index]
    }

    /// Slot pointers of all strong roots (canonical objects and registered
    /// globals).  The symbol table is excluded; the collector handles it
    /// specially.
    pub fn strong_root_slots(&mut self) -> Vec<*mut TaggedValue> {
        let mut slots = Vec::with_capacity(STRONG_ROOT_COUNT + self.global_roots.len());
        for i in 0..STRONG_ROOT_COUNT {
            slots.push(&raw mut self.roots[i]);
        }
        for root in self.global_roots.iter_mut() {
            slots.push(root as *mut TaggedValue);
        }
        slots
    }

    /// Slot pointers of every root including the symbol table.
    pub fn all_root_slots(&mut self) -> Vec<*mut TaggedValue> {
        let mut slots = self.strong_root_slots();
        slots.push(&raw mut self.roots[ROOT_SYMBOL_TABLE]);
        slots
    }

    // ── Collector support ─────────────────────────────────────────────────

    /// Snapshot the space bounds and page tables for collector visitors.
    pub fn view(&self) -> HeapView {
        let lo_ranges = self
            .lo_space
            .object_addresses()
            .iter()
            .map(|&base| {
                let obj = HeapObject::from_address(base);
                // SAFETY: large objects carry valid map words outside the
                // encoded phases; the view is rebuilt before use after any
                // large-object mutation.
                let size = unsafe { object_size(obj, (*obj).map()) };
                (base, base + size)
            })
            .collect();
        HeapView {
            new_low: self.new_space.bottom(),
            new_high: self.new_space.bottom() + self.new_space.capacity(),
            from_low: self.new_space.from_space_low(),
            from_high: self.new_space.from_space_high(),
            lo_ranges,
            old_pages: self.old_space.pages().iter().map(|&p| p as usize).collect(),
            code_pages: self.code_space.pages().iter().map(|&p| p as usize).collect(),
            map_pages: self.map_space.pages().iter().map(|&p| p as usize).collect(),
            empty_string: self.empty_string(),
            // SAFETY: the generic stub is a live canonical code object.
            generic_ic_entry: unsafe { (*self.generic_ic_stub()).entry() },
        }
    }

    /// Recompute every page's remembered set from scratch by walking the
    /// paged spaces and recording slots that hold new-space pointers.
    ///
    /// Invoked by the collector after relocation has committed; also usable
    /// by embedders after bulk pointer surgery.
    pub fn rebuild_rsets(&mut self) {
        let new_low = self.new_space.bottom();
        let new_high = new_low + self.new_space.capacity();
        let mut visitor = RecordWritesVisitor { new_low, new_high };
        for space in [&self.old_space, &self.code_space, &self.map_space] {
            for &page in space.pages() {
                // SAFETY: pages in a live space's chain are live.
                unsafe {
                    (*page).clear_rset();
                    let mut current = (*page).object_area_start();
                    let top = (*page).allocation_top;
                    while current < top {
                        let obj = HeapObject::from_address(current);
                        let map = (*obj).map();
                        let size = object_size(obj, map);
                        crate::objects::iterate_body(
                            obj,
                            (*map).instance_type(),
                            size,
                            &mut visitor,
                        );
                        current += size;
                    }
                }
            }
        }
    }
}

/// Sets remembered-set bits for slots holding new-space pointers.
struct RecordWritesVisitor {
    new_low: usize,
    new_high: usize,
}

impl crate::objects::visit::ObjectVisitor for RecordWritesVisitor {
    fn visit_pointer(&mut self, slot: *mut TaggedValue) {
        // SAFETY: body iteration only hands out live slots.
        let value = unsafe { *slot };
        if let Some(target) = value.as_heap_object() {
            let addr = target as usize;
            if (self.new_low..self.new_high).contains(&addr) {
                let page = Page::from_address(slot as usize);
                // SAFETY: the slot lives in a paged-space page.
                unsafe { (*page).set_rset_bit(slot as usize) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> Heap {
        Heap::new(HeapConfig::default()).expect("heap setup")
    }

    #[test]
    fn setup_creates_self_describing_meta_map() {
        let heap = small_heap();
        let meta = heap.meta_map();
        // SAFETY: the meta map is live.
        unsafe {
            assert_eq!((*meta).instance_type(), InstanceType::Map);
            assert_eq!((*(meta as *mut HeapObject)).map(), meta);
        }
    }

    #[test]
    fn canonical_roots_live_in_their_home_spaces() {
        let heap = small_heap();
        assert!(heap.map_space.contains(heap.fixed_array_map() as usize));
        assert!(heap.old_space.contains(heap.null_value().raw()));
        assert!(heap.old_space.contains(heap.empty_string().raw()));
        assert!(heap.code_space.contains(heap.generic_ic_stub() as usize));
        assert!(heap.old_space.contains(heap.symbol_table() as usize));
        // SAFETY: the canonical null oddball is live.
        unsafe {
            let null = heap.null_value().raw() as *mut Oddball;
            assert_eq!((*null).kind(), 0);
        }
    }

    #[test]
    fn heap_numbers_carry_their_payload() {
        let mut heap = small_heap();
        let number = heap.allocate_heap_number(SpaceId::New, 6.25).unwrap();
        // SAFETY: number is live.
        unsafe {
            assert_eq!((*number).value(), 6.25);
        }
        assert!(heap.contains(number as usize));
    }

    #[test]
    fn fixed_array_allocation_fills_slots_with_null() {
        let mut heap = small_heap();
        let array = heap.allocate_fixed_array(SpaceId::New, 3).unwrap();
        // SAFETY: array is live and 3 slots long.
        unsafe {
            for i in 0..3 {
                assert_eq!((*array).get(i), heap.null_value());
            }
        }
    }

    #[test]
    fn promotion_policy_sends_immutable_payloads_to_code_space() {
        assert_eq!(target_space_for(InstanceType::SeqString), SpaceId::Code);
        assert_eq!(target_space_for(InstanceType::HeapNumber), SpaceId::Code);
        assert_eq!(target_space_for(InstanceType::FixedArray), SpaceId::Old);
        assert_eq!(target_space_for(InstanceType::JsObject), SpaceId::Old);
    }

    #[test]
    fn view_classifies_addresses_by_space() {
        let mut heap = small_heap();
        let young = heap.allocate_fixed_array(SpaceId::New, 1).unwrap() as usize;
        let old = heap.allocate_fixed_array(SpaceId::Old, 1).unwrap() as usize;
        let large = heap.allocate_fixed_array(SpaceId::Large, 4).unwrap() as usize;
        let view = heap.view();
        assert!(view.in_new_space(young));
        assert!(!view.in_new_space(old));
        assert!(view.in_old_space(old));
        assert!(view.in_large_space(large));
        assert!(view.in_map_space(heap.meta_map() as usize));
    }

    #[test]
    fn rebuild_rsets_records_old_to_new_pointers() {
        let mut heap = small_heap();
        let young = heap.allocate_fixed_array(SpaceId::New, 1).unwrap();
        let old = heap.allocate_fixed_array(SpaceId::Old, 2).unwrap();
        // SAFETY: both arrays are live; slot 1 is in bounds.
        unsafe {
            (*old).set(1, TaggedValue::from_heap_object(young as *mut HeapObject));
        }
        heap.rebuild_rsets();
        // SAFETY: the slot lives in an old-space page.
        unsafe {
            let slot = (*old).slot(1) as usize;
            let page = Page::from_address(slot);
            assert!((*page).is_rset_bit_set(slot));
            let null_slot = (*old).slot(0) as usize;
            assert!(!(*page).is_rset_bit_set(null_slot));
        }
    }

    #[test]
    fn stub_cache_round_trip_and_clear() {
        let mut cache = StubCache::default();
        cache.insert(0x1000, 1, TaggedValue(0x2000));
        assert_eq!(cache.lookup(0x1000, 1), Some(TaggedValue(0x2000)));
        assert_eq!(cache.lookup(0x1000, 2), None);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
