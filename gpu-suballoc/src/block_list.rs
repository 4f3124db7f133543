use {
    crate::{
        block::DeviceBlock,
        budget::BudgetTracker,
        config::MAX_LOST_SWEEP_ATTEMPTS,
        error::{AllocationError, MapError},
        handle::{Allocation, AllocationFlavor, AllocationInner},
        stats::PoolStatistics,
        suballoc::{AllocationRequest, PlacementStrategy, RequestContext, SuballocationType},
        AllocationCreateFlags,
    },
    core::sync::atomic::{AtomicU32, AtomicU64, Ordering},
    gpu_suballoc_types::{AllocationFlags, MemoryDevice},
    parking_lot::Mutex,
    std::sync::Arc,
};

/// Claims one slot of the device's live-memory-object limit.
pub(crate) fn take_allocation_slot(remains: &AtomicU32) -> bool {
    let mut current = remains.load(Ordering::Relaxed);
    loop {
        if current == 0 {
            return false;
        }
        match remains.compare_exchange_weak(
            current,
            current - 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

/// Normalized parameters of one block-list allocation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AllocRequest {
    pub size: u64,
    pub alignment: u64,
    pub kind: SuballocationType,
    pub flags: AllocationCreateFlags,
    pub strategy: PlacementStrategy,
    pub user_data: u64,
    pub current_frame: u32,
}

/// Pool of device memory blocks of one memory type, kept sorted by
/// descending free space so scans hit the emptiest block first.
///
/// Serves both the per-type default pools and user pools; the latter get
/// their own block counts and optionally a fixed block size.
#[derive(Debug)]
pub(crate) struct BlockList<M> {
    memory_type: u32,
    heap: usize,
    preferred_block_size: u64,
    min_block_count: usize,
    max_block_count: usize,
    granularity: u64,
    frame_in_use_count: u32,
    explicit_block_size: bool,
    device_address: bool,
    pool_id: u32,
    blocks: Mutex<Vec<Arc<DeviceBlock<M>>>>,
    next_block_id: AtomicU64,
}

impl<M> BlockList<M> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        memory_type: u32,
        heap: usize,
        preferred_block_size: u64,
        min_block_count: usize,
        max_block_count: usize,
        granularity: u64,
        frame_in_use_count: u32,
        explicit_block_size: bool,
        device_address: bool,
        pool_id: u32,
    ) -> Self {
        BlockList {
            memory_type,
            heap,
            preferred_block_size,
            min_block_count,
            max_block_count,
            granularity,
            frame_in_use_count,
            explicit_block_size,
            device_address,
            pool_id,
            blocks: Mutex::new(Vec::new()),
            next_block_id: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn memory_type(&self) -> u32 {
        self.memory_type
    }

    #[inline]
    pub(crate) fn preferred_block_size(&self) -> u64 {
        self.preferred_block_size
    }

    /// Whether no block holds a live allocation.
    pub(crate) fn is_empty(&self) -> bool {
        self.blocks
            .lock()
            .iter()
            .all(|block| block.metadata.lock().is_empty())
    }

    /// Serves one allocation request: scan existing blocks, create a new
    /// block, then reclaim stale allocations, in that order.
    ///
    /// # Safety
    ///
    /// `device` must be the device every block of this list was allocated
    /// from.
    pub(crate) unsafe fn allocate(
        &self,
        device: &impl MemoryDevice<M>,
        budget: &BudgetTracker,
        allocations_remains: &AtomicU32,
        request: &AllocRequest,
    ) -> Result<Allocation<M>, AllocationError>
    where
        M: Clone,
    {
        let mut blocks = self.blocks.lock();

        let can_make_other_lost = request.flags.contains(AllocationCreateFlags::CAN_MAKE_OTHER_LOST)
            && !request.flags.contains(AllocationCreateFlags::NEVER_ALLOCATE);

        let ctx = RequestContext {
            size: request.size,
            alignment: request.alignment,
            granularity: self.granularity,
            kind: request.kind,
            strategy: request.strategy,
            current_frame: request.current_frame,
            frame_in_use_count: self.frame_in_use_count,
            can_make_other_lost: false,
        };

        // First pass never disturbs live allocations.
        for index in 0..blocks.len() {
            let placement = blocks[index].metadata.lock().try_request(&ctx);
            if let Some(placement) = placement {
                return self.commit_placement(device, budget, &mut blocks, index, placement, request);
            }
        }

        if request.flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) {
            return Err(AllocationError::OutOfDeviceMemory);
        }

        if blocks.len() < self.max_block_count {
            let required = crate::align_up(crate::config::DEBUG_MARGIN, request.alignment)
                + request.size
                + crate::config::DEBUG_MARGIN;
            let within_budget = request.flags.contains(AllocationCreateFlags::WITHIN_BUDGET);

            match self.create_block(
                device,
                budget,
                allocations_remains,
                required,
                within_budget,
                &mut blocks,
            ) {
                Ok(index) => {
                    let placement = blocks[index].metadata.lock().try_request(&ctx);
                    let result = match placement {
                        Some(placement) => self
                            .commit_placement(device, budget, &mut blocks, index, placement, request),
                        // a fresh block of sufficient size must fit the request
                        None => Err(AllocationError::OutOfDeviceMemory),
                    };
                    return match result {
                        Ok(allocation) => Ok(allocation),
                        Err(err) => {
                            self.destroy_block(device, budget, allocations_remains, &mut blocks, index);
                            Err(err)
                        }
                    };
                }
                Err(AllocationError::OutOfDeviceMemory) if can_make_other_lost => {}
                Err(err) => return Err(err),
            }
        } else if !can_make_other_lost {
            return Err(AllocationError::OutOfDeviceMemory);
        }

        // Second pass may reclaim stale allocations; pick the cheapest
        // candidate across all blocks and retry when a target is revived
        // concurrently.
        let lost_ctx = RequestContext {
            can_make_other_lost: true,
            ..ctx
        };
        for _ in 0..MAX_LOST_SWEEP_ATTEMPTS {
            let mut best: Option<(usize, AllocationRequest)> = None;
            for (index, block) in blocks.iter().enumerate() {
                if let Some(candidate) = block.metadata.lock().try_request(&lost_ctx) {
                    if best
                        .as_ref()
                        .map_or(true, |(_, prev)| candidate.cost() < prev.cost())
                    {
                        best = Some((index, candidate));
                    }
                }
            }

            let Some((index, mut placement)) = best else { break };

            let reclaimed = blocks[index].metadata.lock().make_requested_lost(
                &mut placement,
                request.current_frame,
                self.frame_in_use_count,
            );
            match reclaimed {
                Some(bytes) => {
                    budget.sub_allocation(self.heap, bytes);
                    return self.commit_placement(device, budget, &mut blocks, index, placement, request);
                }
                None => continue,
            }
        }

        Err(AllocationError::OutOfDeviceMemory)
    }

    /// Frees one block-backed allocation, retiring the block when it
    /// becomes empty and the list may shrink.
    ///
    /// # Safety
    ///
    /// Same contract as [`BlockList::allocate`]; the allocation must have
    /// been placed by this list.
    pub(crate) unsafe fn free(
        &self,
        device: &impl MemoryDevice<M>,
        budget: &BudgetTracker,
        allocations_remains: &AtomicU32,
        inner: &AllocationInner<M>,
    ) where
        M: Clone,
    {
        let AllocationFlavor::Block { block, .. } = &inner.flavor else {
            unreachable!("dedicated allocation routed to a block list");
        };

        let mut blocks = self.blocks.lock();

        // A losing sweep may have reclaimed the allocation while we were
        // waiting for the list lock.
        if inner.is_lost() {
            return;
        }

        let index = blocks
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, block))
            .expect("allocation's block is not in this list");

        if inner.persistently_mapped {
            block.unmap(device);
        }

        let (sum_free, empty) = {
            let mut metadata = block.metadata.lock();
            metadata.free(inner);
            (metadata.sum_free(), metadata.is_empty())
        };
        block.update_sum_free(sum_free);
        budget.sub_allocation(self.heap, inner.size);

        if empty && blocks.len() > self.min_block_count && !self.explicit_block_size {
            self.destroy_block(device, budget, allocations_remains, &mut blocks, index);
        } else {
            Self::reorder_block(&mut blocks, index);
        }
    }

    /// Creates blocks up to the configured minimum.
    ///
    /// # Safety
    ///
    /// Same contract as [`BlockList::allocate`].
    pub(crate) unsafe fn create_min_blocks(
        &self,
        device: &impl MemoryDevice<M>,
        budget: &BudgetTracker,
        allocations_remains: &AtomicU32,
    ) -> Result<(), AllocationError> {
        let mut blocks = self.blocks.lock();
        while blocks.len() < self.min_block_count {
            self.try_create_block(
                device,
                budget,
                allocations_remains,
                self.preferred_block_size,
                false,
                &mut blocks,
            )?;
        }
        Ok(())
    }

    /// Reclaims every stale allocation in the list.
    /// Returns the number of allocations made lost.
    pub(crate) fn make_allocations_lost(&self, current_frame: u32, budget: &BudgetTracker) -> usize {
        let mut blocks = self.blocks.lock();
        let mut lost = 0;
        for block in blocks.iter() {
            let mut metadata = block.metadata.lock();
            let (count, bytes) =
                metadata.make_allocations_lost(current_frame, self.frame_in_use_count);
            if count > 0 {
                lost += count;
                budget.sub_allocation(self.heap, bytes);
                block.update_sum_free(metadata.sum_free());
            }
        }
        blocks.sort_by(|a, b| b.sum_free_cached().cmp(&a.sum_free_cached()));
        lost
    }

    pub(crate) fn collect_stats(&self, stats: &mut PoolStatistics) {
        let blocks = self.blocks.lock();
        for block in blocks.iter() {
            block.metadata.lock().collect_stats(stats);
        }
    }

    /// Returns every block's memory to the driver.
    ///
    /// # Safety
    ///
    /// Same contract as [`BlockList::allocate`].
    pub(crate) unsafe fn dispose(
        &self,
        device: &impl MemoryDevice<M>,
        budget: &BudgetTracker,
        allocations_remains: &AtomicU32,
    ) where
        M: Clone,
    {
        let mut blocks = self.blocks.lock();
        while let Some(block) = blocks.pop() {
            if !block.metadata.lock().is_empty() {
                tracing::error!(
                    "Destroying block {} of memory type {} with live allocations",
                    block.id(),
                    block.memory_type(),
                );
            }
            block.unmap_for_destroy(device);
            budget.sub_block(self.heap, block.size());
            allocations_remains.fetch_add(1, Ordering::Relaxed);
            device.deallocate_memory(block.memory().clone());
        }
    }

    unsafe fn commit_placement(
        &self,
        device: &impl MemoryDevice<M>,
        budget: &BudgetTracker,
        blocks: &mut Vec<Arc<DeviceBlock<M>>>,
        index: usize,
        placement: AllocationRequest,
        request: &AllocRequest,
    ) -> Result<Allocation<M>, AllocationError> {
        let block = blocks[index].clone();

        if request.flags.contains(AllocationCreateFlags::MAPPED) {
            block.map(device).map_err(|err| match err {
                MapError::OutOfDeviceMemory => AllocationError::OutOfDeviceMemory,
                _ => AllocationError::OutOfHostMemory,
            })?;
        }

        let inner = Arc::new(AllocationInner::block_backed(
            request.size,
            request.alignment,
            request.kind,
            request.user_data,
            request.flags.contains(AllocationCreateFlags::CAN_BECOME_LOST),
            request.flags.contains(AllocationCreateFlags::MAPPED),
            request.current_frame,
            self.memory_type,
            self.pool_id,
            block.clone(),
            placement.offset,
        ));

        let sum_free = {
            let mut metadata = block.metadata.lock();
            metadata.commit(placement, request.kind, request.size, inner.clone());
            metadata.sum_free()
        };
        block.update_sum_free(sum_free);
        budget.add_allocation(self.heap, request.size);
        Self::reorder_block(blocks, index);

        Ok(Allocation { inner })
    }

    /// Allocates a new block, starting at the preferred size and halving on
    /// out-of-device-memory down to an eighth of it, or down to the request
    /// size when that is larger.
    unsafe fn create_block(
        &self,
        device: &impl MemoryDevice<M>,
        budget: &BudgetTracker,
        allocations_remains: &AtomicU32,
        min_size: u64,
        within_budget: bool,
        blocks: &mut Vec<Arc<DeviceBlock<M>>>,
    ) -> Result<usize, AllocationError> {
        let mut block_size = if self.explicit_block_size {
            self.preferred_block_size
        } else {
            self.preferred_block_size.max(min_size)
        };
        if block_size < min_size {
            return Err(AllocationError::OutOfDeviceMemory);
        }
        let min_block_size = if self.explicit_block_size {
            block_size
        } else {
            (self.preferred_block_size / 8).max(min_size)
        };

        loop {
            match self.try_create_block(
                device,
                budget,
                allocations_remains,
                block_size,
                within_budget,
                blocks,
            ) {
                Ok(index) => return Ok(index),
                Err(AllocationError::OutOfDeviceMemory) if block_size / 2 >= min_block_size => {
                    block_size /= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }

    unsafe fn try_create_block(
        &self,
        device: &impl MemoryDevice<M>,
        budget: &BudgetTracker,
        allocations_remains: &AtomicU32,
        block_size: u64,
        within_budget: bool,
        blocks: &mut Vec<Arc<DeviceBlock<M>>>,
    ) -> Result<usize, AllocationError> {
        if within_budget {
            let heap_budget = budget.report(self.heap);
            if heap_budget.usage.saturating_add(block_size) > heap_budget.budget {
                return Err(AllocationError::OutOfDeviceMemory);
            }
        }

        if !take_allocation_slot(allocations_remains) {
            return Err(AllocationError::TooManyObjects);
        }
        if !budget.try_add_block(self.heap, block_size) {
            allocations_remains.fetch_add(1, Ordering::Relaxed);
            return Err(AllocationError::OutOfDeviceMemory);
        }

        let flags = if self.device_address {
            AllocationFlags::DEVICE_ADDRESS
        } else {
            AllocationFlags::empty()
        };

        match device.allocate_memory(block_size, self.memory_type, flags, None) {
            Ok(memory) => {
                tracing::debug!(
                    "Block of {} bytes allocated for memory type {}",
                    block_size,
                    self.memory_type,
                );
                let id = self.next_block_id.fetch_add(1, Ordering::Relaxed);
                let block = Arc::new(DeviceBlock::new(memory, block_size, self.memory_type, id));
                let index = blocks.partition_point(|other| other.sum_free_cached() > block_size);
                blocks.insert(index, block);
                Ok(index)
            }
            Err(err) => {
                budget.sub_block(self.heap, block_size);
                allocations_remains.fetch_add(1, Ordering::Relaxed);
                Err(err.into())
            }
        }
    }

    unsafe fn destroy_block(
        &self,
        device: &impl MemoryDevice<M>,
        budget: &BudgetTracker,
        allocations_remains: &AtomicU32,
        blocks: &mut Vec<Arc<DeviceBlock<M>>>,
        index: usize,
    ) where
        M: Clone,
    {
        let block = blocks.remove(index);
        debug_assert!(block.metadata.lock().is_empty());
        tracing::debug!(
            "Block {} of memory type {} returned to the device",
            block.id(),
            block.memory_type(),
        );
        block.unmap_for_destroy(device);
        budget.sub_block(self.heap, block.size());
        allocations_remains.fetch_add(1, Ordering::Relaxed);
        device.deallocate_memory(block.memory().clone());
    }

    /// Restores the descending-free-space order after the block at `index`
    /// changed.
    fn reorder_block(blocks: &mut [Arc<DeviceBlock<M>>], mut index: usize) {
        while index > 0 && blocks[index].sum_free_cached() > blocks[index - 1].sum_free_cached() {
            blocks.swap(index, index - 1);
            index -= 1;
        }
        while index + 1 < blocks.len()
            && blocks[index].sum_free_cached() < blocks[index + 1].sum_free_cached()
        {
            blocks.swap(index, index + 1);
            index += 1;
        }
    }
}
