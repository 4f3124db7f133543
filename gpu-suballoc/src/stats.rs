/// Aggregated statistics of a pool, a block list, or the whole allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    /// Number of device memory blocks.
    pub block_count: usize,

    /// Number of live allocations placed in those blocks.
    pub allocation_count: usize,

    /// Bytes of device memory held.
    pub size: u64,

    /// Bytes held but not handed out to allocations.
    pub unused_size: u64,

    /// Number of free ranges.
    pub unused_range_count: usize,

    /// Size of the largest free range.
    pub largest_unused_range: u64,
}

/// Current byte accounting of one memory heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Budget {
    /// Bytes of device memory held by the allocator on this heap.
    pub block_bytes: u64,

    /// Bytes handed out to live allocations on this heap.
    /// Always at most `block_bytes`.
    pub allocation_bytes: u64,

    /// Estimated bytes in use on this heap process-wide, including usage by
    /// other parts of the process when the device reports it.
    pub usage: u64,

    /// Estimated bytes that may be used on this heap without degradation.
    pub budget: u64,
}
