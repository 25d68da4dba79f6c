//! The type descriptor ([`Map`]) and instance-type tag for heap objects.

use crate::objects::heap_object::{HeapObject, MapWord};
use crate::objects::tagged::TaggedValue;

/// Identifies the concrete type of a heap object.
///
/// Stored directly in the [`Map`] for O(1) lookup.  Values are intentionally
/// left with gaps to leave room for future additions.
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstanceType {
    // ── Internal / structural types ─────────────────────────────────────────
    /// A [`Map`] object itself (the map of a `Map` is the meta map).
    Map = 0x0080,
    /// A fixed-length array of tagged values.
    FixedArray = 0x0088,
    /// A raw byte array; doubles as the filler for swept dead regions.
    ByteArray = 0x0090,
    /// A one-word filler installed over single-slot dead regions.
    OneWordFiller = 0x0098,
    /// A singleton marker value (null).
    Oddball = 0x00a0,
    /// A compiled code object with relocatable call targets.
    Code = 0x00c8,

    // ── Primitive value wrappers ────────────────────────────────────────────
    /// A boxed floating-point number.
    HeapNumber = 0x0400,

    // ── String types ────────────────────────────────────────────────────────
    /// A flat sequential string.
    SeqString = 0x0800,
    /// A concatenation node over two strings.
    ConsString = 0x0808,

    // ── Object types ────────────────────────────────────────────────────────
    /// A plain object whose tagged fields fill its instance size.
    JsObject = 0x1000,
    /// The distinguished global object; counted during marking.
    JsGlobalObject = 0x1080,
}

/// Size of every map object: maps are uniform so map space can free and
/// reuse them slot-by-slot.
pub const MAP_SIZE: usize = 64;

/// The type descriptor of a heap object.
///
/// Every heap object's first word references its `Map`, which records the
/// instance type, the instance size for fixed-size types, and a cache of
/// specialised code keyed by this map.  Maps live in map space at uniform
/// [`MAP_SIZE`] slots; the trailing reserved words pad the struct to exactly
/// one slot.
#[repr(C)]
pub struct Map {
    header: HeapObject,
    instance_type: InstanceType,
    bit_field: u16,
    instance_size: u32,
    code_cache: TaggedValue,
    _reserved: [usize; 5],
}

const _: () = assert!(std::mem::size_of::<Map>() == MAP_SIZE);

impl Map {
    /// Byte offset of the traced `code_cache` slot.
    pub const CODE_CACHE_OFFSET: usize = 16;

    /// Initialise the map at `ptr` in place.
    ///
    /// # Safety
    /// `ptr` must reference `MAP_SIZE` writable, exclusively-owned bytes and
    /// `meta` must be the (possibly self-referential) map of maps.
    pub unsafe fn initialize(
        ptr: *mut Map,
        meta: *mut Map,
        instance_type: InstanceType,
        instance_size: u32,
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            (*ptr).header.set_map_word(MapWord::from_map(meta));
            (*ptr).instance_type = instance_type;
            (*ptr).bit_field = 0;
            (*ptr).instance_size = instance_size;
            (*ptr).code_cache = TaggedValue::zero();
            (*ptr)._reserved = [0; 5];
        }
    }

    /// Build a detached map value for unit tests that do not need a heap.
    pub fn new_detached(instance_type: InstanceType, instance_size: u32) -> Map {
        Map {
            header: HeapObject::new_null(),
            instance_type,
            bit_field: 0,
            instance_size,
            code_cache: TaggedValue::zero(),
            _reserved: [0; 5],
        }
    }

    #[inline]
    pub fn instance_type(&self) -> InstanceType {
        self.instance_type
    }

    /// In-object size (in bytes) of fixed-size instances of this map.
    #[inline]
    pub fn instance_size(&self) -> usize {
        self.instance_size as usize
    }

    #[inline]
    pub fn code_cache(&self) -> TaggedValue {
        self.code_cache
    }

    pub fn set_code_cache(&mut self, cache: TaggedValue) {
        self.code_cache = cache;
    }

    /// Drop the map's code cache so its entries cannot keep code alive.
    pub fn clear_code_cache(&mut self) {
        self.code_cache = TaggedValue::zero();
    }

    /// Slot address of the traced code-cache field.
    pub fn code_cache_slot(&mut self) -> *mut TaggedValue {
        &raw mut self.code_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_struct_occupies_exactly_one_map_slot() {
        assert_eq!(std::mem::size_of::<Map>(), MAP_SIZE);
    }

    #[test]
    fn detached_map_reports_type_and_size() {
        let map = Map::new_detached(InstanceType::JsObject, 32);
        assert_eq!(map.instance_type(), InstanceType::JsObject);
        assert_eq!(map.instance_size(), 32);
    }

    #[test]
    fn clear_code_cache_drops_the_entry() {
        let mut map = Map::new_detached(InstanceType::JsObject, 16);
        map.set_code_cache(TaggedValue(0x4000));
        assert!(map.code_cache().is_heap_object());
        map.clear_code_cache();
        assert_eq!(map.code_cache(), TaggedValue::zero());
    }

    #[test]
    fn instance_type_discriminants_are_unique() {
        let types: &[InstanceType] = &[
            InstanceType::Map,
            InstanceType::FixedArray,
            InstanceType::ByteArray,
            InstanceType::OneWordFiller,
            InstanceType::Oddball,
            InstanceType::Code,
            InstanceType::HeapNumber,
            InstanceType::SeqString,
            InstanceType::ConsString,
            InstanceType::JsObject,
            InstanceType::JsGlobalObject,
        ];
        let discriminants: std::collections::HashSet<u16> =
            types.iter().map(|&t| t as u16).collect();
        assert_eq!(discriminants.len(), types.len());
    }
}
