//! Device memory management.
//!
//! Memory is requested from the driver in whole pages and tracked as
//! [MemNode]s. Nodes are either dedicated to a single resource (persistent
//! allocations) or bump-suballocated into [MemBlock]s by a
//! [DeviceMemoryPool]. When a pool is reset its nodes return to the
//! [Allocator] free lists, bucketed by their size in pages, and get reused by
//! the next pool which needs memory of the same type.

mod allocation_requirements;
mod allocator;
mod backend;
mod mapped_region;
mod mem_node;
mod memory_properties;
mod pool;

pub use self::{
    allocation_requirements::{
        AllocationKind, AllocationRequirements, DedicatedResourceHandle,
    },
    allocator::{Allocator, AllocatorLimits, AllocatorStats},
    backend::{
        into_shared, DeviceBackend, FakeBackend, MemoryBackend, SharedBackend,
        TraceBackend,
    },
    mapped_region::MappedRegion,
    mem_node::{MemBlock, MemNode},
    memory_properties::{
        AllocationUsage, HeapBudget, HeapClass, MemoryProperties,
    },
    pool::DeviceMemoryPool,
};

/// The allocation unit used when requesting memory from the driver.
pub const PAGE_SIZE: u64 = 8 * 1024 * 1024;

/// The largest node, in pages, which is kept in a sized free-list bucket.
/// Larger nodes share the sink bucket at index zero.
pub const MAX_INDEX: usize = 20;

/// Round `value` up to the next multiple of `alignment`.
///
/// Alignments of zero or one leave the value untouched.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// The number of pages needed to hold `size_in_bytes`.
pub fn page_count(size_in_bytes: u64) -> u64 {
    size_in_bytes.div_ceil(PAGE_SIZE).max(1)
}
