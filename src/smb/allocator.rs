/*!
 * SMB Resource Allocator
 * First-fit, offset-based free list with coalescing
 */

use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::types::{align_up, Offset};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Allocator statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub total: u64,
    pub allocated: u64,
    pub free_blocks: usize,
    pub largest_free: u64,
    pub allocations: u64,
}

#[derive(Debug)]
struct FreeList {
    /// Free blocks keyed by start offset, value is the block length
    blocks: BTreeMap<Offset, u64>,
    allocated: u64,
    allocations: u64,
}

/// Offset allocator over one SMB
///
/// All bookkeeping is behind a single mutex; allocations are rare (port
/// construction) compared to data movement.
#[derive(Debug)]
pub struct ResourceAllocator {
    endpoint: String,
    total: u64,
    inner: Mutex<FreeList>,
}

impl ResourceAllocator {
    pub fn new(endpoint: impl Into<String>, total: u64) -> Self {
        let mut blocks = BTreeMap::new();
        if total > 0 {
            blocks.insert(0, total);
        }
        Self {
            endpoint: endpoint.into(),
            total,
            inner: Mutex::new(FreeList {
                blocks,
                allocated: 0,
                allocations: 0,
            }),
        }
    }

    /// Allocate `size` bytes at an offset that is a multiple of `align`
    pub fn alloc(&self, size: u64, align: u64) -> DataplaneResult<Offset> {
        let align = align.max(1);
        if size == 0 || !align.is_power_of_two() {
            return Err(DataplaneError::invalid_state(format!(
                "invalid allocation request: size {} align {}",
                size, align
            )));
        }

        let mut list = self.inner.lock();

        let fit = list.blocks.iter().find_map(|(&start, &len)| {
            let aligned = align_up(start, align);
            let end = aligned.checked_add(size)?;
            (end <= start + len).then_some((start, len, aligned))
        });

        let Some((start, len, aligned)) = fit else {
            warn!(
                "SMB {} exhausted: requested {} bytes (align {}), {} of {} in use",
                self.endpoint, size, align, list.allocated, self.total
            );
            return Err(DataplaneError::NoMoreSharedMemory {
                endpoint: self.endpoint.clone(),
                requested: size,
                alignment: align,
            });
        };

        list.blocks.remove(&start);
        if aligned > start {
            list.blocks.insert(start, aligned - start);
        }
        let tail = start + len - (aligned + size);
        if tail > 0 {
            list.blocks.insert(aligned + size, tail);
        }
        list.allocated += size;
        list.allocations += 1;

        debug!("SMB {} alloc {} bytes at offset {}", self.endpoint, size, aligned);
        Ok(aligned)
    }

    /// Return `size` bytes at `offset` to the free list
    pub fn free(&self, offset: Offset, size: u64) -> DataplaneResult<()> {
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= self.total && size > 0)
            .ok_or(DataplaneError::OutOfBounds {
                offset,
                len: size,
                region_size: self.total,
            })?;

        let mut list = self.inner.lock();

        // Reject frees that overlap a block that is already free
        let prev = list.blocks.range(..end).next_back().map(|(&s, &l)| (s, l));
        if let Some((s, l)) = prev {
            if s + l > offset {
                return Err(DataplaneError::invalid_state(format!(
                    "double free of offset {} ({} bytes) on {}",
                    offset, size, self.endpoint
                )));
            }
        }

        let mut start = offset;
        let mut len = size;

        if let Some((s, l)) = prev {
            if s + l == offset {
                list.blocks.remove(&s);
                start = s;
                len += l;
            }
        }
        if let Some(next_len) = list.blocks.remove(&end) {
            len += next_len;
        }
        list.blocks.insert(start, len);
        list.allocated = list.allocated.saturating_sub(size);

        debug!("SMB {} free {} bytes at offset {}", self.endpoint, size, offset);
        Ok(())
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn stats(&self) -> AllocatorStats {
        let list = self.inner.lock();
        AllocatorStats {
            total: self.total,
            allocated: list.allocated,
            free_blocks: list.blocks.len(),
            largest_free: list.blocks.values().copied().max().unwrap_or(0),
            allocations: list.allocations,
        }
    }
}

/// Group of allocations that is rolled back unless committed
///
/// Used when one logical object needs several regions; a failure part-way
/// leaves the allocator exactly as it was.
pub struct AllocationBatch<'a> {
    allocator: &'a ResourceAllocator,
    taken: Vec<(Offset, u64)>,
    committed: bool,
}

impl<'a> AllocationBatch<'a> {
    pub fn new(allocator: &'a ResourceAllocator) -> Self {
        Self {
            allocator,
            taken: Vec::new(),
            committed: false,
        }
    }

    pub fn alloc(&mut self, size: u64, align: u64) -> DataplaneResult<Offset> {
        let offset = self.allocator.alloc(size, align)?;
        self.taken.push((offset, size));
        Ok(offset)
    }

    /// Keep every allocation; the caller now owns them
    pub fn commit(mut self) -> Vec<(Offset, u64)> {
        self.committed = true;
        std::mem::take(&mut self.taken)
    }
}

impl Drop for AllocationBatch<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for &(offset, size) in self.taken.iter().rev() {
            if let Err(e) = self.allocator.free(offset, size) {
                log::error!("Rollback of offset {} ({} bytes) failed: {}", offset, size, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_alloc_respects_alignment() {
        let allocator = ResourceAllocator::new("test", 1024);
        assert_eq!(allocator.alloc(10, 8).unwrap(), 0);
        assert_eq!(allocator.alloc(8, 64).unwrap(), 64);
        // The gap between 10 and 64 is reused by a small aligned request
        assert_eq!(allocator.alloc(8, 8).unwrap(), 16);
    }

    #[test]
    fn test_free_coalesces_neighbours() {
        let allocator = ResourceAllocator::new("test", 300);
        let a = allocator.alloc(100, 1).unwrap();
        let b = allocator.alloc(100, 1).unwrap();
        let c = allocator.alloc(100, 1).unwrap();
        allocator.free(a, 100).unwrap();
        allocator.free(c, 100).unwrap();
        allocator.free(b, 100).unwrap();

        let stats = allocator.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.largest_free, 300);
        assert_eq!(stats.allocated, 0);
    }

    #[test]
    fn test_double_free_rejected() {
        let allocator = ResourceAllocator::new("test", 128);
        let a = allocator.alloc(32, 8).unwrap();
        allocator.free(a, 32).unwrap();
        assert!(allocator.free(a, 32).is_err());
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let allocator = ResourceAllocator::new("test", 64);
        allocator.alloc(64, 8).unwrap();
        let err = allocator.alloc(8, 8).unwrap_err();
        assert!(err.is_exhaustion());
    }

    #[test]
    fn test_batch_rolls_back_on_drop() {
        let allocator = ResourceAllocator::new("test", 256);
        {
            let mut batch = AllocationBatch::new(&allocator);
            batch.alloc(64, 8).unwrap();
            batch.alloc(64, 8).unwrap();
            assert!(batch.alloc(512, 8).is_err());
        }
        assert_eq!(allocator.stats().allocated, 0);
        assert_eq!(allocator.alloc(256, 8).unwrap(), 0);
    }

    #[test]
    fn test_batch_commit_keeps_allocations() {
        let allocator = ResourceAllocator::new("test", 256);
        let mut batch = AllocationBatch::new(&allocator);
        batch.alloc(64, 8).unwrap();
        let kept = batch.commit();
        assert_eq!(kept, vec![(0, 64)]);
        assert_eq!(allocator.stats().allocated, 64);
    }
}
