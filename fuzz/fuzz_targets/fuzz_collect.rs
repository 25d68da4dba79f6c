#![no_main]

use libfuzzer_sys::fuzz_target;

use clinker_core::flags::CollectorFlags;
use clinker_core::gc::collector::MarkCompactCollector;
use clinker_core::gc::tracer::GcTracer;
use clinker_core::handles::GlobalHandles;
use clinker_core::heap::{Heap, HeapConfig, SpaceId};
use clinker_core::objects::array::FixedArray;
use clinker_core::objects::tagged::TaggedValue;

// Fuzz the collector: build a random object graph, then interleave garbage
// creation with sweep-only and compacting collections.
//
// Each input byte encodes one operation:
//   0 – allocate a rooted fixed array whose length comes from the high bits
//   1 – allocate an unrooted old-space byte array (instant garbage)
//   2 – link the two most recently rooted arrays (edge from older to newer)
//   3 – run a sweep-only collection
//   4 – run a compacting collection
//   _ – allocate a short string in new space
fuzz_target!(|data: &[u8]| {
    const MAX_OPS: usize = 128;

    let Ok(mut heap) = Heap::new(HeapConfig::default()) else {
        return;
    };
    let mut handles = GlobalHandles::new();
    let mut roots: Vec<usize> = Vec::new();

    for &byte in data.iter().take(MAX_OPS) {
        let op = byte & 0x7;
        let arg = (byte >> 3) as usize;
        match op {
            0 => {
                if let Ok(array) = heap.allocate_fixed_array(SpaceId::Old, 1 + arg % 8) {
                    roots.push(heap.add_global_root(TaggedValue(array as usize)));
                }
            }
            1 => {
                let _ = heap.allocate_byte_array(SpaceId::Old, arg * 8);
            }
            2 => {
                if roots.len() >= 2 {
                    let from = heap.global_root(roots[roots.len() - 2]);
                    let to = heap.global_root(roots[roots.len() - 1]);
                    if let Some(from) = from.as_heap_object() {
                        let array = from as *mut FixedArray;
                        // SAFETY: the root still references the live array,
                        // and every rooted array has at least one slot.
                        unsafe { (*array).set(0, to) };
                    }
                }
            }
            3 | 4 => {
                let flags = if op == 3 {
                    CollectorFlags {
                        never_compact: true,
                        ..CollectorFlags::default()
                    }
                } else {
                    CollectorFlags {
                        always_compact: true,
                        ..CollectorFlags::default()
                    }
                };
                let mut tracer = GcTracer::new();
                // SAFETY: the fuzz mutator is quiescent during collection.
                unsafe {
                    MarkCompactCollector::new(&mut heap, &mut handles, &mut tracer, &flags)
                        .collect();
                }
                assert_eq!(tracer.marked_count(), 0);
            }
            _ => {
                let _ = heap.allocate_seq_string(SpaceId::New, b"fuzz");
            }
        }
    }
});
