//! The young generation: two equal semi-spaces.
//!
//! Mutator allocation bumps through the active half ("to space" by
//! convention).  The inactive half ("from space") is unused between
//! collections and is repurposed by the collector as scratch storage: first
//! as the marking stack, then as the out-of-line forwarding table, and
//! finally as the relocation arena for young objects that are not promoted.
//! After relocation the halves are flipped.

use std::alloc::{alloc, dealloc, Layout};

use crate::error::{HeapError, HeapResult};
use crate::heap::page::POINTER_SIZE;

/// A contiguous fixed-size memory region with a bump cursor.
struct MemoryRegion {
    base: *mut u8,
    capacity: usize,
    used: usize,
}

// SAFETY: the region exclusively owns its backing allocation.
unsafe impl Send for MemoryRegion {}

impl MemoryRegion {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity % POINTER_SIZE == 0);
        let layout = Layout::from_size_align(capacity, POINTER_SIZE).expect("valid layout");
        // SAFETY: the layout is non-zero-sized and validly aligned.
        let base = unsafe { alloc(layout) };
        assert!(!base.is_null(), "semi-space allocation failed");
        Self {
            base,
            capacity,
            used: 0,
        }
    }

    fn base(&self) -> usize {
        self.base as usize
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(self.capacity, POINTER_SIZE).expect("valid layout");
        // SAFETY: base was allocated with this exact layout.
        unsafe { dealloc(self.base, layout) };
    }
}

/// The young generation's semi-space pair.
pub struct NewSpace {
    to_space: MemoryRegion,
    from_space: MemoryRegion,
    /// Addresses below this in the active half survived a previous cycle.
    age_mark: usize,
    /// Relocation arena cursor in from-space; 0 outside a collection.
    mc_top: usize,
}

impl NewSpace {
    /// Create a semi-space pair of `semi_size` bytes per half.
    pub fn new(semi_size: usize) -> Self {
        let to_space = MemoryRegion::new(semi_size);
        let from_space = MemoryRegion::new(semi_size);
        let age_mark = to_space.base();
        Self {
            to_space,
            from_space,
            age_mark,
            mc_top: 0,
        }
    }

    /// Bump-allocate `size` bytes in the active half.
    pub fn allocate_raw(&mut self, size: usize) -> HeapResult<usize> {
        debug_assert!(size % POINTER_SIZE == 0);
        if self.to_space.used + size > self.to_space.capacity {
            return Err(HeapError::OutOfMemory("new"));
        }
        let addr = self.to_space.base() + self.to_space.used;
        self.to_space.used += size;
        Ok(addr)
    }

    /// Lowest address of the active half.
    pub fn bottom(&self) -> usize {
        self.to_space.base()
    }

    /// Allocation top of the active half.
    pub fn top(&self) -> usize {
        self.to_space.base() + self.to_space.used
    }

    /// Bytes allocated in the active half.
    pub fn used(&self) -> usize {
        self.to_space.used
    }

    /// Capacity of each half.
    pub fn capacity(&self) -> usize {
        self.to_space.capacity
    }

    pub fn age_mark(&self) -> usize {
        self.age_mark
    }

    pub fn set_age_mark(&mut self, mark: usize) {
        self.age_mark = mark;
    }

    /// Returns `true` if `addr` lies in the active half.
    pub fn contains(&self, addr: usize) -> bool {
        (self.to_space.base()..self.to_space.base() + self.to_space.capacity).contains(&addr)
    }

    /// Returns `true` if `addr` lies in the inactive half.
    pub fn from_space_contains(&self, addr: usize) -> bool {
        (self.from_space.base()..self.from_space.base() + self.from_space.capacity)
            .contains(&addr)
    }

    /// Byte offset of an active-half address from the half's base.
    pub fn to_space_offset_for_address(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr) || addr == self.top());
        addr - self.to_space.base()
    }

    /// Byte offset of an inactive-half address from the half's base.
    pub fn from_space_offset_for_address(&self, addr: usize) -> usize {
        debug_assert!(self.from_space_contains(addr));
        addr - self.from_space.base()
    }

    /// Lowest address of the inactive half.
    pub fn from_space_low(&self) -> usize {
        self.from_space.base()
    }

    /// One past the highest address of the inactive half.
    pub fn from_space_high(&self) -> usize {
        self.from_space.base() + self.from_space.capacity
    }

    // ── Mark-compact protocol ─────────────────────────────────────────────

    /// Point the relocation arena at the bottom of the inactive half.
    pub fn mc_reset_relocation_info(&mut self) {
        self.mc_top = self.from_space.base();
    }

    /// Allocate `size` relocation bytes in the inactive half.
    ///
    /// Cannot fail: the inactive half equals the active half in size, and at
    /// most the active half's live bytes are relocated here.
    pub fn mc_allocate_raw(&mut self, size: usize) -> usize {
        debug_assert!(size % POINTER_SIZE == 0);
        let addr = self.mc_top;
        self.mc_top += size;
        assert!(
            self.mc_top <= self.from_space_high(),
            "new-space relocation exceeded the inactive semi-space"
        );
        addr
    }

    /// Exchange the halves after relocation.
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.to_space, &mut self.from_space);
    }

    /// Commit the relocated extent as the active half's allocation top.
    ///
    /// Must be called after [`flip`][Self::flip]; the relocation cursor
    /// points into what is now the active half.
    pub fn mc_commit_relocation_info(&mut self) {
        debug_assert!(
            self.mc_top == 0
                || (self.to_space.base()..=self.to_space.base() + self.to_space.capacity)
                    .contains(&self.mc_top)
        );
        self.to_space.used = self.mc_top - self.to_space.base();
        self.from_space.used = 0;
        self.mc_top = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_linear_from_the_bottom() {
        let mut space = NewSpace::new(1024);
        let a = space.allocate_raw(32).unwrap();
        let b = space.allocate_raw(16).unwrap();
        assert_eq!(a, space.bottom());
        assert_eq!(b, a + 32);
        assert_eq!(space.used(), 48);
    }

    #[test]
    fn allocation_fails_when_the_half_is_full() {
        let mut space = NewSpace::new(64);
        space.allocate_raw(64).unwrap();
        assert!(space.allocate_raw(8).is_err());
    }

    #[test]
    fn halves_do_not_overlap() {
        let space = NewSpace::new(256);
        assert!(!space.from_space_contains(space.bottom()));
        assert!(!space.contains(space.from_space_low()));
    }

    #[test]
    fn offsets_mirror_between_halves() {
        let mut space = NewSpace::new(256);
        let a = space.allocate_raw(24).unwrap();
        let offset = space.to_space_offset_for_address(a);
        assert_eq!(offset, 0);
        let mirrored = space.from_space_low() + offset;
        assert_eq!(space.from_space_offset_for_address(mirrored), offset);
    }

    #[test]
    fn flip_and_commit_adopt_the_relocated_extent() {
        let mut space = NewSpace::new(256);
        space.allocate_raw(64).unwrap();
        space.mc_reset_relocation_info();
        let dest = space.mc_allocate_raw(32);
        assert!(space.from_space_contains(dest));
        space.flip();
        space.mc_commit_relocation_info();
        assert_eq!(space.used(), 32);
        assert!(space.contains(dest), "relocated extent is now active");
        assert_eq!(space.bottom(), dest);
    }
}
