//!
//! Sub-allocating memory allocator for Vulkan-like APIs.
//!
//! Device memory objects are expensive and limited in number, so requests
//! are served by carving sub-ranges out of large blocks pooled per memory
//! type. Very large or driver-requested allocations are served by dedicated
//! memory objects instead. Per-heap byte budgets are tracked against
//! driver-reported or heuristic limits.
//!

mod allocator;
mod block;
mod block_list;
mod budget;
mod config;
mod dedicated;
mod error;
mod handle;
mod stats;
mod suballoc;
mod usage;

pub use {
    self::{
        allocator::{GpuAllocator, PoolCreateInfo, PoolHandle},
        config::{AllocatorCreateFlags, Config, DEFAULT_LARGE_HEAP_BLOCK_SIZE},
        error::{AllocationError, MapError},
        handle::Allocation,
        stats::{Budget, PoolStatistics},
        suballoc::SuballocationType,
        usage::MemoryUsage,
    },
    gpu_suballoc_types::*,
};

bitflags::bitflags! {
    /// Flags shaping how one allocation request is served.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocationCreateFlags: u32 {
        /// Serve the request with its own memory object.
        const DEDICATED_MEMORY = 0x01;

        /// Never allocate a new memory object for this request; place it in
        /// an existing block or fail.
        const NEVER_ALLOCATE = 0x02;

        /// Map the memory persistently for the lifetime of the allocation.
        const MAPPED = 0x04;

        /// The allocation may be reclaimed when it stays unused past the
        /// frame-in-use window and another request asks for its space.
        const CAN_BECOME_LOST = 0x08;

        /// The request may reclaim stale allocations made with
        /// `CAN_BECOME_LOST` when no free range fits.
        const CAN_MAKE_OTHER_LOST = 0x10;

        /// Fail instead of exceeding the driver-reported heap budget.
        const WITHIN_BUDGET = 0x20;
    }
}

/// Placement strategy for an allocation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    /// Minimize wasted memory by taking the smallest fitting free range.
    BestFit,

    /// Minimize search time by taking the first fitting free range.
    FirstFit,

    /// Keep small free ranges intact by splitting the largest one.
    WorstFit,
}

/// How an allocation request is routed and placed.
#[derive(Clone, Copy, Debug)]
pub struct AllocationCreateInfo<'a, M> {
    pub flags: AllocationCreateFlags,

    /// Usage hint translated into memory property preferences.
    pub usage: MemoryUsage,

    /// Properties the chosen memory type must carry.
    pub required_flags: MemoryPropertyFlags,

    /// Properties the chosen memory type should carry.
    pub preferred_flags: MemoryPropertyFlags,

    /// Extra restriction on acceptable memory types, on top of the
    /// requirements mask. Zero means no restriction.
    pub memory_type_bits: u32,

    /// Placement strategy. `None` uses best-fit.
    pub strategy: Option<AllocationStrategy>,

    /// Pool to allocate from instead of the default per-type pools.
    pub pool: Option<&'a PoolHandle<M>>,

    /// Opaque value stored in the allocation.
    pub user_data: u64,
}

impl<M> Default for AllocationCreateInfo<'_, M> {
    fn default() -> Self {
        AllocationCreateInfo {
            flags: AllocationCreateFlags::empty(),
            usage: MemoryUsage::Unknown,
            required_flags: MemoryPropertyFlags::empty(),
            preferred_flags: MemoryPropertyFlags::empty(),
            memory_type_bits: 0,
            strategy: None,
            pool: None,
            user_data: 0,
        }
    }
}

/// Dedicated-allocation requirements the driver reported for a resource.
#[derive(Clone, Copy, Debug, Default)]
pub struct DedicatedAllocateInfo {
    /// Resource the dedicated allocation will be bound to.
    pub resource: Option<DedicatedResource>,

    /// Driver requires a dedicated allocation for the resource.
    pub required: bool,

    /// Driver prefers a dedicated allocation for the resource.
    pub preferred: bool,
}

/// Aligns `value` up to `alignment`, which must be a power of two.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Aligns `value` down to `alignment`, which must be a power of two.
pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}
