use crate::align_up;

/// Default size of a device memory block carved out of a large heap.
pub const DEFAULT_LARGE_HEAP_BLOCK_SIZE: u64 = 256 * 1024 * 1024;

/// Heaps at most this large get blocks of an eighth of the heap instead of
/// [`DEFAULT_LARGE_HEAP_BLOCK_SIZE`].
pub(crate) const SMALL_HEAP_MAX_SIZE: u64 = 1024 * 1024 * 1024;

pub(crate) const PREFERRED_BLOCK_SIZE_ALIGNMENT: u64 = 32;

/// Cost of reclaiming one live allocation during a losing scan, added per
/// item on top of the reclaimed bytes.
pub(crate) const LOST_ALLOCATION_COST: u64 = 1_048_576;

/// Successful allocations between driver budget re-polls.
pub(crate) const OPS_BEFORE_BUDGET_REPOLL: u32 = 30;

/// Free ranges smaller than this are not entered into the size-sorted free
/// index. Build-time knob.
pub(crate) const MIN_FREE_SUBALLOC_SIZE_TO_REGISTER: u64 = 16;

/// Bytes of free padding kept on both sides of every suballocation.
/// Build-time knob, zero in release configurations.
pub(crate) const DEBUG_MARGIN: u64 = 0;

/// Sentinel value of `last_use_frame` marking an allocation as lost.
pub(crate) const FRAME_INDEX_LOST: u32 = u32::MAX;

/// Bound on retries of the losing scan when targets are revived concurrently.
pub(crate) const MAX_LOST_SWEEP_ATTEMPTS: u32 = 32;

bitflags::bitflags! {
    /// Capabilities the allocator was created with. Each one must be backed
    /// by the corresponding device feature or extension.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocatorCreateFlags: u32 {
        /// Device supports the memory-budget query; the allocator will poll
        /// it periodically instead of using the 80%-of-heap heuristic.
        const EXT_MEMORY_BUDGET = 0x1;

        /// Use AMD device-coherent memory types. Without this flag those
        /// types are excluded from every allocation.
        const AMD_DEVICE_COHERENT_MEMORY = 0x2;

        /// Allocate all memory with the device-address capability so buffers
        /// placed in it may retrieve device addresses.
        const BUFFER_DEVICE_ADDRESS = 0x4;
    }
}

/// Configuration for [`GpuAllocator`].
///
/// [`GpuAllocator`]: crate::GpuAllocator
#[derive(Clone, Debug)]
pub struct Config {
    /// Preferred size of a device memory block allocated from a large heap.
    /// Heaps of at most 1 GiB use an eighth of the heap size instead.
    pub preferred_large_heap_block_size: u64,

    /// Number of frames after the last recorded use during which an
    /// allocation that can become lost is still protected from reclaiming.
    pub frame_in_use_count: u32,

    /// Optional user ceilings on bytes of device memory held per heap,
    /// indexed like the device heap array. `None` entries are unlimited.
    pub heap_size_limits: Option<Box<[Option<u64>]>>,

    /// Capability flags.
    pub flags: AllocatorCreateFlags,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            preferred_large_heap_block_size: DEFAULT_LARGE_HEAP_BLOCK_SIZE,
            frame_in_use_count: 0,
            heap_size_limits: None,
            flags: AllocatorCreateFlags::empty(),
        }
    }
}

impl Config {
    /// Preferred size of new blocks for a heap of the given size.
    pub(crate) fn preferred_block_size(&self, heap_size: u64) -> u64 {
        if heap_size <= SMALL_HEAP_MAX_SIZE {
            align_up(heap_size / 8, PREFERRED_BLOCK_SIZE_ALIGNMENT)
        } else {
            self.preferred_large_heap_block_size
        }
    }
}
