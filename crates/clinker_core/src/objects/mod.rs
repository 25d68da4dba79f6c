//! The managed object model: headers, type descriptors, and body layout.

/// Fixed arrays, byte arrays, and the symbol table view.
pub mod array;
/// Compiled code objects and relocatable call targets.
pub mod code;
/// The `HeapObject` base type and the overloaded map word.
pub mod heap_object;
/// Type descriptor ([`map::Map`]) and instance-type tag.
pub mod map;
/// Flat and cons string representations.
pub mod string;
/// Tagged smi / heap-pointer values.
pub mod tagged;
/// The pointer-traversal capability interface.
pub mod visit;

use crate::heap::page::POINTER_SIZE;
use crate::objects::array::{ByteArray, FixedArray, FIXED_ARRAY_HEADER_SIZE};
use crate::objects::code::{Code, RELOC_KIND_CODE_TARGET, RELOC_KIND_DEBUG_CALL};
use crate::objects::heap_object::HeapObject;
use crate::objects::map::{InstanceType, Map, MAP_SIZE};
use crate::objects::string::{ConsString, SeqString, CONS_STRING_SIZE};
use crate::objects::tagged::TaggedValue;
use crate::objects::visit::ObjectVisitor;

/// Size of a boxed number (map word + f64 payload).
pub const HEAP_NUMBER_SIZE: usize = 16;

/// A boxed floating-point number.
#[repr(C)]
pub struct HeapNumber {
    header: HeapObject,
    value: f64,
}

const _: () = assert!(std::mem::size_of::<HeapNumber>() == HEAP_NUMBER_SIZE);

impl HeapNumber {
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }
}

/// Size of an oddball (map word + kind word).
pub const ODDBALL_SIZE: usize = 16;

/// A singleton marker value; the canonical null lives in old space as one.
#[repr(C)]
pub struct Oddball {
    header: HeapObject,
    kind: usize,
}

const _: () = assert!(std::mem::size_of::<Oddball>() == ODDBALL_SIZE);

impl Oddball {
    pub fn kind(&self) -> usize {
        self.kind
    }

    pub fn set_kind(&mut self, kind: usize) {
        self.kind = kind;
    }
}

/// A plain object: its map's instance size covers the header plus tagged
/// fields stored inline.
#[repr(C)]
pub struct JsObject {
    header: HeapObject,
}

impl JsObject {
    /// Byte offset of the first inline field.
    pub const FIELDS_OFFSET: usize = POINTER_SIZE;

    /// Number of inline fields for an instance of `instance_size` bytes.
    pub const fn field_count(instance_size: usize) -> usize {
        (instance_size - Self::FIELDS_OFFSET) / POINTER_SIZE
    }

    /// Address of inline field `index`.
    ///
    /// # Safety
    /// `index` must be below the field count implied by the object's map.
    pub unsafe fn field_slot(&self, index: usize) -> *mut TaggedValue {
        (self.header.address() + Self::FIELDS_OFFSET + index * POINTER_SIZE) as *mut TaggedValue
    }

    /// Read inline field `index`.
    ///
    /// # Safety
    /// As for [`field_slot`][Self::field_slot]; the object must be
    /// initialised.
    pub unsafe fn get_field(&self, index: usize) -> TaggedValue {
        // SAFETY: per this function's contract.
        unsafe { *self.field_slot(index) }
    }

    /// Write inline field `index`.
    ///
    /// # Safety
    /// As for [`field_slot`][Self::field_slot].
    pub unsafe fn set_field(&mut self, index: usize, value: TaggedValue) {
        // SAFETY: per this function's contract.
        unsafe { *self.field_slot(index) = value };
    }
}

/// Compute the size of the object at `obj` from `map`.
///
/// The map may be passed separately from the object's own map word because
/// several collection phases must size objects whose map word is marked or
/// holds an encoded forwarding reference.  Only `map`'s plain fields are
/// read, never its own map word, so this stays valid while map space is in
/// its encoded state.
///
/// # Safety
/// `obj` must point to an initialised object of `map`'s instance type, and
/// `map` must point to an initialised map.
pub unsafe fn object_size(obj: *mut HeapObject, map: *mut Map) -> usize {
    // SAFETY: reads of plain fields per this function's contract.
    unsafe {
        match (*map).instance_type() {
            InstanceType::Map => MAP_SIZE,
            InstanceType::FixedArray => (*(obj as *mut FixedArray)).size(),
            InstanceType::ByteArray => (*(obj as *mut ByteArray)).size(),
            InstanceType::OneWordFiller => POINTER_SIZE,
            InstanceType::Oddball => ODDBALL_SIZE,
            InstanceType::Code => (*(obj as *mut Code)).size(),
            InstanceType::HeapNumber => HEAP_NUMBER_SIZE,
            InstanceType::SeqString => (*(obj as *mut SeqString)).size(),
            InstanceType::ConsString => CONS_STRING_SIZE,
            InstanceType::JsObject | InstanceType::JsGlobalObject => (*map).instance_size(),
        }
    }
}

/// Visit every pointer slot in the body of the object at `obj`.
///
/// `instance_type` and `object_size` are passed in by the caller because the
/// object's map word may be unavailable (marked or encoded) at visit time.
///
/// # Safety
/// `obj` must point to an initialised object of the given type and size, and
/// all of its slots must be live storage for the duration of the call.
pub unsafe fn iterate_body<V: ObjectVisitor>(
    obj: *mut HeapObject,
    instance_type: InstanceType,
    object_size: usize,
    visitor: &mut V,
) {
    let base = obj as usize;
    // SAFETY: all slot addresses below stay within [base, base + object_size).
    unsafe {
        match instance_type {
            InstanceType::Map => {
                visitor.visit_pointer((*(obj as *mut Map)).code_cache_slot());
            }
            InstanceType::FixedArray => {
                let start = (base + FIXED_ARRAY_HEADER_SIZE) as *mut TaggedValue;
                let end = (base + object_size) as *mut TaggedValue;
                visitor.visit_pointer_range(start, end);
            }
            InstanceType::ConsString => {
                let start = (base + ConsString::FIRST_OFFSET) as *mut TaggedValue;
                let end = (base + CONS_STRING_SIZE) as *mut TaggedValue;
                visitor.visit_pointer_range(start, end);
            }
            InstanceType::JsObject | InstanceType::JsGlobalObject => {
                let start = (base + JsObject::FIELDS_OFFSET) as *mut TaggedValue;
                let end = (base + object_size) as *mut TaggedValue;
                visitor.visit_pointer_range(start, end);
            }
            InstanceType::Code => {
                let code = obj as *mut Code;
                visitor.begin_code_iteration(code);
                let object_form = (*code).ic_targets_are_objects();
                for i in 0..(*code).reloc_count() {
                    let entry = (*code).reloc_entry(i);
                    let slot = &raw mut (*entry).target;
                    if object_form {
                        visitor.visit_pointer(slot as *mut TaggedValue);
                    } else {
                        match (*entry).kind {
                            RELOC_KIND_CODE_TARGET => visitor.visit_code_target(slot),
                            RELOC_KIND_DEBUG_CALL => visitor.visit_debug_target(slot),
                            kind => unreachable!("unknown relocation kind {kind}"),
                        }
                    }
                }
                visitor.end_code_iteration(code);
            }
            InstanceType::ByteArray
            | InstanceType::OneWordFiller
            | InstanceType::Oddball
            | InstanceType::HeapNumber
            | InstanceType::SeqString => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectingVisitor {
        slots: Vec<usize>,
    }

    impl ObjectVisitor for CollectingVisitor {
        fn visit_pointer(&mut self, slot: *mut TaggedValue) {
            self.slots.push(slot as usize);
        }
    }

    #[test]
    fn fixed_array_body_covers_every_slot() {
        let mut buf = vec![0u64; FixedArray::size_for(3) / 8];
        let obj = buf.as_mut_ptr() as *mut HeapObject;
        // SAFETY: buf is zeroed and large enough for a 3-element array.
        unsafe {
            (*(obj as *mut FixedArray)).set_length(3);
            let mut v = CollectingVisitor { slots: Vec::new() };
            iterate_body(obj, InstanceType::FixedArray, FixedArray::size_for(3), &mut v);
            assert_eq!(v.slots.len(), 3);
            assert_eq!(v.slots[0], obj as usize + FIXED_ARRAY_HEADER_SIZE);
        }
    }

    #[test]
    fn seq_string_body_has_no_pointers() {
        let mut buf = vec![0u64; 4];
        let obj = buf.as_mut_ptr() as *mut HeapObject;
        let mut v = CollectingVisitor { slots: Vec::new() };
        // SAFETY: buf is zeroed and large enough.
        unsafe { iterate_body(obj, InstanceType::SeqString, 32, &mut v) };
        assert!(v.slots.is_empty());
    }

    #[test]
    fn cons_string_body_visits_both_children() {
        let mut buf = vec![0u64; CONS_STRING_SIZE / 8];
        let obj = buf.as_mut_ptr() as *mut HeapObject;
        let mut v = CollectingVisitor { slots: Vec::new() };
        // SAFETY: buf is zeroed and exactly one cons node.
        unsafe { iterate_body(obj, InstanceType::ConsString, CONS_STRING_SIZE, &mut v) };
        assert_eq!(v.slots.len(), 2);
    }

    #[test]
    fn js_object_body_visits_inline_fields_only() {
        let size = 8 + 2 * POINTER_SIZE;
        let mut buf = vec![0u64; size / 8];
        let obj = buf.as_mut_ptr() as *mut HeapObject;
        let mut v = CollectingVisitor { slots: Vec::new() };
        // SAFETY: buf is zeroed and large enough.
        unsafe { iterate_body(obj, InstanceType::JsObject, size, &mut v) };
        assert_eq!(v.slots.len(), 2);
        assert_eq!(v.slots[0], obj as usize + JsObject::FIELDS_OFFSET);
    }
}
