//! The large-object space: individually allocated oversized objects that
//! never move.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use crate::error::{HeapError, HeapResult};
use crate::heap::page::POINTER_SIZE;
use crate::objects::heap_object::HeapObject;
use crate::objects::map::InstanceType;

/// A space of individually allocated objects tracked in a list.
///
/// Large objects are reclaimed wholesale by
/// [`free_unmarked_objects`][Self::free_unmarked_objects]; they are never
/// compacted or relocated.
pub struct LargeObjectSpace {
    objects: Vec<(usize, usize)>,
}

// SAFETY: the space exclusively owns its allocations.
unsafe impl Send for LargeObjectSpace {}

impl LargeObjectSpace {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
        }
    }

    /// Allocate a zeroed large object of `size` bytes.
    pub fn allocate(&mut self, size: usize) -> HeapResult<usize> {
        debug_assert!(size % POINTER_SIZE == 0);
        let layout = Layout::from_size_align(size, POINTER_SIZE).expect("valid layout");
        // SAFETY: the layout is non-zero-sized and validly aligned.
        let raw = unsafe { alloc_zeroed(layout) };
        if raw.is_null() {
            return Err(HeapError::OutOfMemory("large"));
        }
        self.objects.push((raw as usize, size));
        Ok(raw as usize)
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.objects
            .iter()
            .any(|&(base, size)| (base..base + size).contains(&addr))
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Addresses of all tracked objects, in allocation order.
    pub fn object_addresses(&self) -> Vec<usize> {
        self.objects.iter().map(|&(base, _)| base).collect()
    }

    /// Free every unmarked object, clear marks on the survivors, and return
    /// the survivor count.
    ///
    /// # Safety
    /// Every tracked object must carry a valid (possibly marked) map word;
    /// the caller must be between the marking and encoding phases so map
    /// fields are still readable.
    pub unsafe fn free_unmarked_objects(&mut self) -> usize {
        let mut survivors = 0;
        self.objects.retain(|&(base, size)| {
            let obj = HeapObject::from_address(base);
            // SAFETY: the object header is live per this function's contract.
            unsafe {
                if (*obj).is_marked() {
                    (*obj).clear_mark();
                    survivors += 1;
                    true
                } else {
                    if (*(*obj).map()).instance_type() == InstanceType::Code {
                        tracing::debug!(target: "code", address = base, "code delete");
                    }
                    let layout =
                        Layout::from_size_align(size, POINTER_SIZE).expect("valid layout");
                    dealloc(base as *mut u8, layout);
                    false
                }
            }
        });
        survivors
    }
}

impl Default for LargeObjectSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LargeObjectSpace {
    fn drop(&mut self) {
        for &(base, size) in &self.objects {
            let layout = Layout::from_size_align(size, POINTER_SIZE).expect("valid layout");
            // SAFETY: each allocation was created with its stored layout.
            unsafe { dealloc(base as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::map::Map;

    #[test]
    fn allocate_tracks_and_contains() {
        let mut space = LargeObjectSpace::new();
        let a = space.allocate(4096).unwrap();
        assert_eq!(space.object_count(), 1);
        assert!(space.contains(a));
        assert!(space.contains(a + 4095));
        assert!(!space.contains(a + 4096));
    }

    #[test]
    fn free_unmarked_objects_keeps_marked_and_drops_the_rest() {
        let mut space = LargeObjectSpace::new();
        let mut map = Map::new_detached(InstanceType::FixedArray, 0);
        let live = space.allocate(4096).unwrap();
        let _dead = space.allocate(4096).unwrap();
        // SAFETY: both objects are live allocations; map outlives the call.
        unsafe {
            (*HeapObject::from_address(live)).set_map(&raw mut map);
            (*HeapObject::from_address(_dead)).set_map(&raw mut map);
            (*HeapObject::from_address(live)).set_mark();
            let survivors = space.free_unmarked_objects();
            assert_eq!(survivors, 1);
            assert!(!(*HeapObject::from_address(live)).is_marked());
        }
        assert_eq!(space.object_count(), 1);
        assert!(space.contains(live));
    }
}
