//! Compiled code objects and their relocatable call targets.
//!
//! A code object's layout is a fixed header, the instruction body, then a
//! table of relocation entries:
//!
//! ```text
//! +------------------+ 0
//! | header (32 B)    |   map word, body size, flags, entry count,
//! |                  |   instruction_start (absolute, self-referential)
//! +------------------+ CODE_HEADER_SIZE
//! | instructions     |   body_size bytes, padded to 8
//! +------------------+
//! | reloc entries    |   reloc_count × RelocEntry
//! +------------------+
//! ```
//!
//! The entry point of a code object is always `address + CODE_HEADER_SIZE`,
//! so a call-site target in *address* form (a raw entry-point pointer) maps
//! back to its code object by constant arithmetic ([`Code::from_entry`]).
//!
//! While a compacting collection runs, the marker switches call-site targets
//! to *object* form — the target code object's header address — so that the
//! pointer-updating phase relocates them like any other reference.  They are
//! switched back to address form as each code object is relocated (or, for
//! code that does not move, in a dedicated pass).

use bitflags::bitflags;

use crate::heap::page::align_object_size;
use crate::objects::heap_object::HeapObject;

/// Size of the fixed code-object header.
pub const CODE_HEADER_SIZE: usize = 32;

/// Size of one relocation entry (kind word + target word).
pub const RELOC_ENTRY_SIZE: usize = 16;

/// Relocation entry kind: an inline-cache / call code target.
pub const RELOC_KIND_CODE_TARGET: usize = 0;
/// Relocation entry kind: a debugger break call target.
pub const RELOC_KIND_DEBUG_CALL: usize = 1;

bitflags! {
    /// Flag bits of a code object.
    #[repr(transparent)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct CodeFlags: u32 {
        /// This code object is an inline-cache stub.
        const IC_STUB = 1 << 0;
        /// Relocation targets currently hold object (header) pointers
        /// instead of entry-point addresses.
        const IC_TARGETS_ARE_OBJECTS = 1 << 1;
    }
}

/// One call-site record in a code object's relocation table.
#[repr(C)]
pub struct RelocEntry {
    /// One of the `RELOC_KIND_*` values.
    pub kind: usize,
    /// The call target, in address or object form per the owning code
    /// object's [`CodeFlags::IC_TARGETS_ARE_OBJECTS`] flag.
    pub target: usize,
}

const _: () = assert!(std::mem::size_of::<RelocEntry>() == RELOC_ENTRY_SIZE);

/// A compiled code object.
#[repr(C)]
pub struct Code {
    header: HeapObject,
    body_size: u32,
    reloc_count: u32,
    flags: CodeFlags,
    _pad: u32,
    /// Absolute address of this object's own instruction area.  The one
    /// PC-absolute internal reference every code object carries; adjusted by
    /// [`relocate`][Self::relocate] when the object moves.
    instruction_start: usize,
}

const _: () = assert!(std::mem::size_of::<Code>() == CODE_HEADER_SIZE);

impl Code {
    /// Initialise the code object at `ptr` in place.  The relocation-entry
    /// targets are left zeroed for the caller to fill in.
    ///
    /// # Safety
    /// `ptr` must reference at least `size_for(body_size, reloc_count)`
    /// writable, exclusively-owned, zeroed bytes.
    pub unsafe fn initialize(ptr: *mut Code, body_size: u32, reloc_count: u32, flags: CodeFlags) {
        // SAFETY: per this function's contract.
        unsafe {
            (*ptr).body_size = body_size;
            (*ptr).reloc_count = reloc_count;
            (*ptr).flags = flags;
            (*ptr)._pad = 0;
            (*ptr).instruction_start = (*ptr).entry();
        }
    }

    /// Total object size for a body of `body_size` bytes and `reloc_count`
    /// relocation entries.
    pub fn size_for(body_size: u32, reloc_count: u32) -> usize {
        CODE_HEADER_SIZE + align_object_size(body_size as usize)
            + reloc_count as usize * RELOC_ENTRY_SIZE
    }

    /// Size of this code object.
    pub fn size(&self) -> usize {
        Self::size_for(self.body_size, self.reloc_count)
    }

    /// Address of this code object's header.
    #[inline]
    pub fn address(&self) -> usize {
        self as *const Code as usize
    }

    /// Entry point: the first instruction byte.
    #[inline]
    pub fn entry(&self) -> usize {
        self.address() + CODE_HEADER_SIZE
    }

    /// Recover a code object from an entry-point (address-form) target.
    #[inline]
    pub fn from_entry(entry: usize) -> *mut Code {
        debug_assert!(entry > CODE_HEADER_SIZE);
        (entry - CODE_HEADER_SIZE) as *mut Code
    }

    #[inline]
    pub fn is_ic_stub(&self) -> bool {
        self.flags.contains(CodeFlags::IC_STUB)
    }

    #[inline]
    pub fn ic_targets_are_objects(&self) -> bool {
        self.flags.contains(CodeFlags::IC_TARGETS_ARE_OBJECTS)
    }

    /// Record that call-site targets now hold object (header) pointers.
    pub fn set_ic_targets_are_objects(&mut self) {
        self.flags.insert(CodeFlags::IC_TARGETS_ARE_OBJECTS);
    }

    pub fn reloc_count(&self) -> usize {
        self.reloc_count as usize
    }

    pub fn body_size(&self) -> usize {
        self.body_size as usize
    }

    /// The recorded instruction-start address.
    pub fn instruction_start(&self) -> usize {
        self.instruction_start
    }

    /// Address of the relocation entry table (it follows the padded body).
    fn reloc_entries_start(&self) -> usize {
        self.address() + CODE_HEADER_SIZE + align_object_size(self.body_size as usize)
    }

    /// Pointer to relocation entry `index`.
    ///
    /// # Safety
    /// `index` must be below `reloc_count` and the object must be fully
    /// initialised.
    pub unsafe fn reloc_entry(&self, index: usize) -> *mut RelocEntry {
        debug_assert!(index < self.reloc_count as usize);
        (self.reloc_entries_start() + index * RELOC_ENTRY_SIZE) as *mut RelocEntry
    }

    /// Switch every call-site target from object form back to address form
    /// and clear the representation flag.
    ///
    /// # Safety
    /// Targets must currently be in object form and reference live (already
    /// relocated) code objects.
    pub unsafe fn convert_ic_targets_to_address(&mut self) {
        debug_assert!(self.ic_targets_are_objects());
        for i in 0..self.reloc_count as usize {
            // SAFETY: i < reloc_count and the entry table is in-bounds.
            let entry = unsafe { self.reloc_entry(i) };
            // SAFETY: the target holds a code-object header address; its
            // entry point is at a constant offset.
            unsafe {
                if (*entry).target != 0 {
                    (*entry).target += CODE_HEADER_SIZE;
                }
            }
        }
        self.flags.remove(CodeFlags::IC_TARGETS_ARE_OBJECTS);
    }

    /// Adjust PC-absolute internal references after this object moved by
    /// `delta` bytes.
    pub fn relocate(&mut self, delta: isize) {
        self.instruction_start = self.instruction_start.wrapping_add_signed(delta);
    }
}

/// Clear the inline cache at a call-site slot by repointing it at the shared
/// generic stub's entry.
///
/// # Safety
/// `slot` must be a live address-form call-site slot and `generic_entry`
/// must be the entry point of the canonical generic stub.
pub unsafe fn clear_ic_at(slot: *mut usize, generic_entry: usize) {
    // SAFETY: per this function's contract.
    unsafe { *slot = generic_entry };
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Allocate a zeroed buffer large enough for a code object and return
    /// both the buffer (for ownership) and the initialised code pointer.
    fn make_code(body_size: u32, reloc_count: u32, flags: CodeFlags) -> (Vec<u64>, *mut Code) {
        let size = Code::size_for(body_size, reloc_count);
        let mut buf = vec![0u64; size / 8];
        let ptr = buf.as_mut_ptr() as *mut Code;
        // SAFETY: buf is zeroed, exclusively owned and large enough.
        unsafe { Code::initialize(ptr, body_size, reloc_count, flags) };
        (buf, ptr)
    }

    #[test]
    fn size_accounts_for_header_padded_body_and_entries() {
        assert_eq!(Code::size_for(0, 0), 32);
        assert_eq!(Code::size_for(5, 0), 32 + 8);
        assert_eq!(Code::size_for(8, 2), 32 + 8 + 32);
    }

    #[test]
    fn entry_round_trips_through_from_entry() {
        let (_buf, code) = make_code(16, 0, CodeFlags::empty());
        // SAFETY: code is live for the duration of the test.
        let entry = unsafe { (*code).entry() };
        assert_eq!(Code::from_entry(entry), code);
    }

    #[test]
    fn initialize_records_fields_and_own_instruction_start() {
        let (_buf, code) = make_code(16, 0, CodeFlags::empty());
        // SAFETY: code is live.
        unsafe {
            assert_eq!((*code).body_size(), 16);
            assert_eq!((*code).reloc_count(), 0);
            assert_eq!((*code).instruction_start(), (*code).entry());
        }
    }

    #[test]
    fn relocate_shifts_instruction_start_by_delta() {
        let (_buf, code) = make_code(16, 0, CodeFlags::empty());
        // SAFETY: code is live.
        unsafe {
            let before = (*code).instruction_start();
            (*code).relocate(4096);
            assert_eq!((*code).instruction_start(), before + 4096);
            (*code).relocate(-4096);
            assert_eq!((*code).instruction_start(), before);
        }
    }

    #[test]
    fn convert_ic_targets_flips_object_form_back_to_entries() {
        let (_target_buf, target) = make_code(8, 0, CodeFlags::IC_STUB);
        let (_buf, code) = make_code(8, 1, CodeFlags::empty());
        // SAFETY: both objects are live; entry 0 exists.
        unsafe {
            (*code).set_ic_targets_are_objects();
            let entry = (*code).reloc_entry(0);
            (*entry).kind = RELOC_KIND_CODE_TARGET;
            (*entry).target = target as usize; // object form
            (*code).convert_ic_targets_to_address();
            assert!(!(*code).ic_targets_are_objects());
            assert_eq!((*entry).target, (*target).entry());
        }
    }

    #[test]
    fn clear_ic_repoints_the_slot_at_the_generic_stub() {
        let (_gbuf, generic) = make_code(8, 0, CodeFlags::empty());
        let mut slot: usize = 0xdead_0000;
        // SAFETY: slot and generic are live.
        unsafe {
            clear_ic_at(&raw mut slot, (*generic).entry());
            assert_eq!(slot, (*generic).entry());
        }
    }
}
