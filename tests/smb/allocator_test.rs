/*!
 * Allocator Test
 * Exhaustion is recoverable and freed memory coalesces back to one block
 */

use circuit_dataplane::smb::{AllocationBatch, ResourceAllocator};
use circuit_dataplane::DataplaneError;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[test]
fn test_exhaust_free_and_reallocate_everything() {
    let allocator = ResourceAllocator::new("ocpi-smb-pio:test:65536.0.1", 64 * 1024);

    let mut blocks = Vec::new();
    loop {
        match allocator.alloc(4096, 64) {
            Ok(offset) => blocks.push(offset),
            Err(err) => {
                assert!(matches!(err, DataplaneError::NoMoreSharedMemory { requested: 4096, .. }));
                break;
            }
        }
    }
    assert_eq!(blocks.len(), 16);
    assert_eq!(allocator.stats().allocated, 64 * 1024);

    // Free in an interleaved order so coalescing has to merge both sides
    for offset in blocks.iter().step_by(2).chain(blocks.iter().skip(1).step_by(2)) {
        allocator.free(*offset, 4096).unwrap();
    }

    let stats = allocator.stats();
    assert_eq!(stats.allocated, 0);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(allocator.alloc(64 * 1024, 8).unwrap(), 0);
}

#[test]
fn test_failed_batch_leaves_no_trace() {
    let allocator = ResourceAllocator::new("ocpi-smb-pio:test:8192.0.1", 8192);
    let keep = allocator.alloc(1024, 8).unwrap();
    {
        let mut batch = AllocationBatch::new(&allocator);
        batch.alloc(2048, 64).unwrap();
        batch.alloc(2048, 64).unwrap();
        assert!(batch.alloc(4096, 64).unwrap_err().is_exhaustion());
    }
    assert_eq!(allocator.stats().allocated, 1024);
    allocator.free(keep, 1024).unwrap();
    assert_eq!(allocator.stats().largest_free, 8192);
}

proptest! {
    #[test]
    fn prop_allocations_never_overlap(sizes in prop::collection::vec(1u64..2048, 1..40)) {
        let allocator = ResourceAllocator::new("ocpi-smb-pio:prop:32768.0.1", 32 * 1024);
        let mut taken: Vec<(u64, u64)> = Vec::new();
        for size in sizes {
            if let Ok(offset) = allocator.alloc(size, 8) {
                prop_assert_eq!(offset % 8, 0);
                for &(o, s) in &taken {
                    prop_assert!(offset + size <= o || o + s <= offset);
                }
                taken.push((offset, size));
            }
        }
        for (offset, size) in taken {
            allocator.free(offset, size).unwrap();
        }
        prop_assert_eq!(allocator.stats().free_blocks, 1);
    }
}
