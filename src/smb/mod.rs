/*!
 * Shared-Memory Blocks
 * Byte regions addressed by offset, their allocator, and per-endpoint resources
 */

mod allocator;
mod region;
mod resources;

pub use allocator::{AllocationBatch, AllocatorStats, ResourceAllocator};
pub use region::Region;
pub use resources::{SmbResources, SmemServices};
