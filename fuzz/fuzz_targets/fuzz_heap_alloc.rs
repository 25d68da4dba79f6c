#![no_main]

use libfuzzer_sys::fuzz_target;

use clinker_core::heap::{Heap, HeapConfig, SpaceId};

// Fuzz the space allocators: spray variable-size allocations across the
// spaces and check the accounting invariants after every operation.
fuzz_target!(|data: &[u8]| {
    const MAX_ALLOCS: usize = 256;

    let Ok(mut heap) = Heap::new(HeapConfig::default()) else {
        return;
    };

    let mut allocs = 0usize;
    let mut chunk = data;
    while chunk.len() >= 2 && allocs < MAX_ALLOCS {
        let selector = chunk[0] & 0x3;
        let length = chunk[1] as usize;
        chunk = &chunk[2..];
        allocs += 1;

        match selector {
            0 => {
                let _ = heap.allocate_fixed_array(SpaceId::Old, length % 64);
            }
            1 => {
                let _ = heap.allocate_byte_array(SpaceId::New, length * 2);
            }
            2 => {
                let _ = heap.allocate_byte_array(SpaceId::Large, 4096 + length * 8);
            }
            _ => {
                let _ = heap.allocate_seq_string(SpaceId::Old, &chunk[..chunk.len().min(8)]);
            }
        }

        assert!(heap.new_space.used() <= heap.new_space.capacity());
        assert!(
            heap.old_space.available_free() + heap.old_space.waste()
                <= heap.old_space.page_count() * 8192
        );
    }
});
