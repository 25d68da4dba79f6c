//! The pointer-traversal capability interface shared by the collector's
//! visitor roles (marking, updating, remembered-set recording).

use crate::objects::code::Code;
use crate::objects::tagged::TaggedValue;

/// A visitor over the pointer slots of heap objects and roots.
///
/// Body iteration dispatches statically on the implementing type; the
/// default methods make most visitors one- or two-method implementations.
///
/// All slot pointers handed to a visitor reference live storage for the
/// duration of the call; implementations may rewrite the slot in place.
pub trait ObjectVisitor {
    /// Visit one tagged slot.
    fn visit_pointer(&mut self, slot: *mut TaggedValue);

    /// Visit every tagged slot in `[start, end)`.
    fn visit_pointer_range(&mut self, start: *mut TaggedValue, end: *mut TaggedValue) {
        let mut slot = start;
        while slot < end {
            self.visit_pointer(slot);
            // SAFETY: slot stays within the caller-provided range.
            slot = unsafe { slot.add(1) };
        }
    }

    /// Visit a call-site slot holding a code target in *address* form
    /// (the target code object's entry point).
    fn visit_code_target(&mut self, slot: *mut usize) {
        let _ = slot;
    }

    /// Visit a debugger call-site slot holding a target in *address* form.
    fn visit_debug_target(&mut self, slot: *mut usize) {
        let _ = slot;
    }

    /// Called before the relocation entries of `code` are visited.
    fn begin_code_iteration(&mut self, code: *mut Code) {
        let _ = code;
    }

    /// Called after the relocation entries of `code` have been visited.
    fn end_code_iteration(&mut self, code: *mut Code) {
        let _ = code;
    }
}
