use {
    crate::{
        block_list::{take_allocation_slot, AllocRequest, BlockList},
        budget::BudgetTracker,
        config::{Config, AllocatorCreateFlags, FRAME_INDEX_LOST},
        dedicated::DedicatedSet,
        error::{AllocationError, MapError},
        handle::{Allocation, AllocationFlavor, AllocationInner, DEFAULT_POOL_ID},
        stats::{Budget, PoolStatistics},
        suballoc::{PlacementStrategy, SuballocationType},
        usage::{derive_flag_sets, find_memory_type_index, FlagSets, MemoryUsage},
        align_down, align_up, AllocationCreateFlags, AllocationCreateInfo, AllocationStrategy,
        DedicatedAllocateInfo,
    },
    core::{
        ptr::NonNull,
        sync::atomic::{AtomicU32, Ordering},
    },
    gpu_suballoc_types::{
        DedicatedResource, DeviceMapError, DeviceProperties, MappedMemoryRange, MemoryDevice,
        MemoryHeap, MemoryPropertyFlags, MemoryRequirements, MemoryType,
    },
    parking_lot::RwLock,
    std::sync::Arc,
};

/// Parameters of a user memory pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolCreateInfo {
    /// Memory type every block of the pool is allocated from.
    pub memory_type_index: u32,

    /// Fixed size for the pool's blocks. `None` uses the same heuristic as
    /// the default pools, with halving on out-of-device-memory.
    pub block_size: Option<u64>,

    /// Number of blocks allocated up front and kept alive.
    pub min_block_count: usize,

    /// Ceiling on the number of blocks. `None` is unlimited.
    pub max_block_count: Option<usize>,

    /// Lost-allocation protection window for this pool.
    pub frame_in_use_count: u32,
}

impl Default for PoolCreateInfo {
    fn default() -> Self {
        PoolCreateInfo {
            memory_type_index: 0,
            block_size: None,
            min_block_count: 0,
            max_block_count: None,
            frame_in_use_count: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Pool<M> {
    id: u32,
    block_list: BlockList<M>,
}

/// Handle of a user memory pool created with [`GpuAllocator::create_pool`].
#[derive(Debug)]
pub struct PoolHandle<M> {
    pool: Arc<Pool<M>>,
}

impl<M> Clone for PoolHandle<M> {
    fn clone(&self) -> Self {
        PoolHandle {
            pool: self.pool.clone(),
        }
    }
}

/// Sub-allocating, budget-aware memory allocator for one device.
///
/// All methods take `&self`; the allocator may be shared between threads
/// freely. The device is passed into every call the way it was provided to
/// [`GpuAllocator::new`].
#[derive(Debug)]
pub struct GpuAllocator<M> {
    memory_types: Box<[MemoryType]>,
    memory_heaps: Box<[MemoryHeap]>,
    global_memory_type_mask: u32,
    max_memory_allocation_size: u64,
    non_coherent_atom_size: u64,
    buffer_image_granularity: u64,
    integrated_gpu: bool,
    buffer_device_address: bool,
    current_frame: AtomicU32,
    allocations_remains: AtomicU32,
    budget: BudgetTracker,
    default_pools: Box<[BlockList<M>]>,
    dedicated: Box<[DedicatedSet<M>]>,
    pools: RwLock<Vec<Arc<Pool<M>>>>,
    next_pool_id: AtomicU32,
}

impl<M> GpuAllocator<M> {
    /// Creates a new allocator instance.
    /// Provided `DeviceProperties` must match the properties of the
    /// `MemoryDevice` that will be used with it.
    pub fn new(config: Config, props: DeviceProperties<'_>) -> Self {
        assert!(
            props.non_coherent_atom_size.is_power_of_two(),
            "`non_coherent_atom_size` must be power of two"
        );
        assert!(
            props.buffer_image_granularity.is_power_of_two(),
            "`buffer_image_granularity` must be power of two"
        );
        assert!(config.frame_in_use_count < FRAME_INDEX_LOST);

        let memory_types: Box<[MemoryType]> = props.memory_types.as_ref().into();
        let memory_heaps: Box<[MemoryHeap]> = props.memory_heaps.as_ref().into();

        let mut global_memory_type_mask = 0u32;
        for (index, memory_type) in memory_types.iter().enumerate() {
            let coherent_amd = memory_type
                .props
                .contains(MemoryPropertyFlags::DEVICE_COHERENT_AMD);
            if !coherent_amd
                || config
                    .flags
                    .contains(AllocatorCreateFlags::AMD_DEVICE_COHERENT_MEMORY)
            {
                global_memory_type_mask |= 1 << index;
            }
        }

        let budget = BudgetTracker::new(
            &memory_heaps,
            config.heap_size_limits.as_deref(),
            config.flags.contains(AllocatorCreateFlags::EXT_MEMORY_BUDGET),
        );

        let buffer_device_address = props.buffer_device_address
            && config
                .flags
                .contains(AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS);

        let default_pools = memory_types
            .iter()
            .enumerate()
            .map(|(index, memory_type)| {
                let heap = memory_type.heap as usize;
                BlockList::new(
                    index as u32,
                    heap,
                    config.preferred_block_size(memory_heaps[heap].size),
                    0,
                    usize::MAX,
                    props.buffer_image_granularity,
                    config.frame_in_use_count,
                    false,
                    buffer_device_address,
                    DEFAULT_POOL_ID,
                )
            })
            .collect();

        GpuAllocator {
            global_memory_type_mask,
            max_memory_allocation_size: props.max_memory_allocation_size,
            non_coherent_atom_size: props.non_coherent_atom_size,
            buffer_image_granularity: props.buffer_image_granularity,
            integrated_gpu: props.integrated_gpu,
            buffer_device_address,
            current_frame: AtomicU32::new(0),
            allocations_remains: AtomicU32::new(props.max_memory_allocation_count),
            budget,
            default_pools,
            dedicated: memory_types.iter().map(|_| DedicatedSet::new()).collect(),
            pools: RwLock::new(Vec::new()),
            next_pool_id: AtomicU32::new(DEFAULT_POOL_ID + 1),
            memory_types,
            memory_heaps,
        }
    }

    /// Records the index of the frame the host is about to render.
    /// This is the only input of the lost-allocation machinery.
    pub fn set_current_frame_index(&self, frame: u32) {
        assert_ne!(frame, FRAME_INDEX_LOST);
        self.current_frame.store(frame, Ordering::Release);
    }

    pub fn current_frame_index(&self) -> u32 {
        self.current_frame.load(Ordering::Acquire)
    }

    /// Memory types of the device this allocator was created for.
    pub fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    /// Memory heaps of the device this allocator was created for.
    pub fn memory_heaps(&self) -> &[MemoryHeap] {
        &self.memory_heaps
    }

    /// Records a use of the allocation at the current frame, protecting it
    /// from the losing machinery for the frame-in-use window.
    /// Returns `false` if the allocation is already lost.
    pub fn touch_allocation(&self, allocation: &Allocation<M>) -> bool {
        allocation.inner.touch(self.current_frame_index())
    }

    /// Picks the memory type an allocation with the given requirements
    /// mask and creation parameters would be placed in.
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        create_info: &AllocationCreateInfo<'_, M>,
    ) -> Result<u32, AllocationError> {
        let (mask, sets) = self.candidate_types(memory_type_bits, create_info);
        find_memory_type_index(mask, &sets, &self.memory_types)
            .ok_or(AllocationError::NoCompatibleMemoryType)
    }

    /// Current byte accounting of every heap.
    pub fn heap_budgets(&self) -> Box<[Budget]> {
        (0..self.budget.heap_count())
            .map(|heap| self.budget.report(heap))
            .collect()
    }

    /// Aggregated statistics across the default pools, user pools and
    /// dedicated allocations.
    pub fn calculate_statistics(&self) -> PoolStatistics {
        let mut stats = PoolStatistics::default();
        for list in self.default_pools.iter() {
            list.collect_stats(&mut stats);
        }
        for pool in self.pools.read().iter() {
            pool.block_list.collect_stats(&mut stats);
        }
        for set in self.dedicated.iter() {
            set.collect_stats(&mut stats);
        }
        stats
    }

    /// Statistics of one user pool.
    pub fn pool_statistics(&self, pool: &PoolHandle<M>) -> PoolStatistics {
        let mut stats = PoolStatistics::default();
        pool.pool.block_list.collect_stats(&mut stats);
        stats
    }

    /// Reclaims every stale allocation of the pool.
    /// Returns the number of allocations made lost.
    pub fn make_pool_allocations_lost(&self, pool: &PoolHandle<M>) -> usize {
        pool.pool
            .block_list
            .make_allocations_lost(self.current_frame_index(), &self.budget)
    }

    fn heap_of_type(&self, memory_type: u32) -> usize {
        self.memory_types[memory_type as usize].heap as usize
    }

    /// Minimum alignment for allocations of the type: host-visible
    /// non-coherent memory must be atom-aligned so flush and invalidate
    /// ranges never touch a neighbour.
    fn memory_type_min_alignment(&self, memory_type: u32) -> u64 {
        let props = self.memory_types[memory_type as usize].props;
        if props.contains(MemoryPropertyFlags::HOST_VISIBLE)
            && !props.contains(MemoryPropertyFlags::HOST_COHERENT)
        {
            self.non_coherent_atom_size
        } else {
            1
        }
    }

    fn candidate_types(
        &self,
        memory_type_bits: u32,
        create_info: &AllocationCreateInfo<'_, M>,
    ) -> (u32, FlagSets) {
        let mut mask = memory_type_bits & self.global_memory_type_mask;
        if create_info.memory_type_bits != 0 {
            mask &= create_info.memory_type_bits;
        }
        let sets = derive_flag_sets(
            create_info.usage,
            create_info.required_flags,
            create_info.preferred_flags,
            self.integrated_gpu,
        );
        (mask, sets)
    }
}

impl<M> GpuAllocator<M>
where
    M: Clone,
{
    /// Allocates memory for the given requirements.
    ///
    /// `kind` tags the resource the memory will back, so that linear and
    /// non-linear resources are kept apart at buffer-image granularity.
    ///
    /// # Safety
    ///
    /// * `device` must be the one whose `DeviceProperties` were provided to
    ///   create this allocator instance.
    /// * The same `device` must be used for all interactions with this
    ///   allocator and the allocations obtained from it.
    pub unsafe fn allocate_memory(
        &self,
        device: &impl MemoryDevice<M>,
        reqs: &MemoryRequirements,
        create_info: &AllocationCreateInfo<'_, M>,
        dedicated_info: Option<&DedicatedAllocateInfo>,
        kind: SuballocationType,
    ) -> Result<Allocation<M>, AllocationError> {
        self.validate_request(reqs, create_info, dedicated_info, kind)?;

        if reqs.size > self.max_memory_allocation_size {
            return Err(AllocationError::OutOfDeviceMemory);
        }

        if let Some(handle) = create_info.pool {
            let list = &handle.pool.block_list;
            let request = self.block_request(reqs, create_info, kind, list.memory_type());
            let allocation =
                list.allocate(device, &self.budget, &self.allocations_remains, &request)?;
            self.budget.note_successful_allocation(device);
            return Ok(allocation);
        }

        let (mut type_mask, sets) = self.candidate_types(reqs.allowed_type_mask, create_info);

        let mut first = true;
        loop {
            let index = match find_memory_type_index(type_mask, &sets, &self.memory_types) {
                Some(index) => index,
                None if first => return Err(AllocationError::NoCompatibleMemoryType),
                None => return Err(AllocationError::OutOfDeviceMemory),
            };
            first = false;

            match self.allocate_memory_of_type(device, index, reqs, create_info, dedicated_info, kind)
            {
                Ok(allocation) => {
                    self.budget.note_successful_allocation(device);
                    return Ok(allocation);
                }
                // other types may still have room
                Err(AllocationError::OutOfDeviceMemory) => {
                    type_mask &= !(1u32 << index);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Frees an allocation. Freeing a lost allocation is a no-op.
    ///
    /// # Safety
    ///
    /// * The allocation must have been obtained from this allocator.
    /// * Same `device` contract as [`GpuAllocator::allocate_memory`].
    pub unsafe fn free_memory(&self, device: &impl MemoryDevice<M>, allocation: Allocation<M>) {
        let inner = allocation.inner;
        match &inner.flavor {
            AllocationFlavor::Block { memory_type, pool, .. } => {
                if inner.is_lost() {
                    return;
                }
                if *pool == DEFAULT_POOL_ID {
                    self.default_pools[*memory_type as usize].free(
                        device,
                        &self.budget,
                        &self.allocations_remains,
                        &inner,
                    );
                } else {
                    let pools = self.pools.read();
                    match pools.iter().find(|candidate| candidate.id == *pool) {
                        Some(owner) => owner.block_list.free(
                            device,
                            &self.budget,
                            &self.allocations_remains,
                            &inner,
                        ),
                        None => {
                            tracing::error!("Allocation freed after its pool was destroyed")
                        }
                    }
                }
            }
            AllocationFlavor::Dedicated {
                memory_type,
                memory,
                mapping,
            } => {
                let removed = self.dedicated[*memory_type as usize].remove(&inner);
                debug_assert!(removed, "dedicated allocation freed twice");

                if mapping.lock().clear() {
                    device.unmap_memory(memory);
                }
                device.deallocate_memory(memory.clone());

                let heap = self.heap_of_type(*memory_type);
                self.budget.sub_allocation(heap, inner.size);
                self.budget.sub_block(heap, inner.size);
                self.allocations_remains.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dedicated memory object deallocated");
            }
        }
    }

    /// Maps the allocation into host address space. Mappings are reference
    /// counted; every `map_memory` must be paired with an `unmap_memory`.
    ///
    /// # Safety
    ///
    /// Same contract as [`GpuAllocator::free_memory`].
    pub unsafe fn map_memory(
        &self,
        device: &impl MemoryDevice<M>,
        allocation: &Allocation<M>,
    ) -> Result<NonNull<u8>, MapError> {
        let inner = &allocation.inner;
        let props = self.memory_types[inner.memory_type() as usize].props;
        if !props.contains(MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(MapError::NonHostVisible);
        }

        match &inner.flavor {
            AllocationFlavor::Block { block, offset, .. } => {
                if inner.is_lost() {
                    return Err(MapError::AllocationLost);
                }
                let ptr = block.map(device)?;
                Ok(NonNull::new_unchecked(ptr.as_ptr().add(*offset as usize)))
            }
            AllocationFlavor::Dedicated {
                memory, mapping, ..
            } => {
                let mut mapping = mapping.lock();
                if let Some(ptr) = mapping.acquire() {
                    return Ok(ptr);
                }
                let ptr = device.map_memory(memory, 0, inner.size)?;
                mapping.init(ptr);
                Ok(ptr)
            }
        }
    }

    /// Releases one mapping reference of the allocation.
    ///
    /// # Safety
    ///
    /// Same contract as [`GpuAllocator::free_memory`]; the allocation must
    /// be mapped.
    pub unsafe fn unmap_memory(&self, device: &impl MemoryDevice<M>, allocation: &Allocation<M>) {
        match &allocation.inner.flavor {
            AllocationFlavor::Block { block, .. } => block.unmap(device),
            AllocationFlavor::Dedicated {
                memory, mapping, ..
            } => {
                if mapping.lock().release() {
                    device.unmap_memory(memory);
                }
            }
        }
    }

    /// Flushes host writes to a range of the allocation.
    /// No-op for host-coherent memory. `size == u64::MAX` means to the end
    /// of the allocation.
    ///
    /// # Safety
    ///
    /// Same contract as [`GpuAllocator::free_memory`]; the range must be
    /// mapped.
    pub unsafe fn flush_allocation(
        &self,
        device: &impl MemoryDevice<M>,
        allocation: &Allocation<M>,
        offset: u64,
        size: u64,
    ) -> Result<(), AllocationError> {
        match self.mapped_range(allocation, offset, size) {
            Some((memory, range_offset, range_size)) => {
                device.flush_memory_ranges(&[MappedMemoryRange {
                    memory,
                    offset: range_offset,
                    size: range_size,
                }])?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Invalidates a range of the allocation before host reads.
    /// No-op for host-coherent memory. `size == u64::MAX` means to the end
    /// of the allocation.
    ///
    /// # Safety
    ///
    /// Same contract as [`GpuAllocator::flush_allocation`].
    pub unsafe fn invalidate_allocation(
        &self,
        device: &impl MemoryDevice<M>,
        allocation: &Allocation<M>,
        offset: u64,
        size: u64,
    ) -> Result<(), AllocationError> {
        match self.mapped_range(allocation, offset, size) {
            Some((memory, range_offset, range_size)) => {
                device.invalidate_memory_ranges(&[MappedMemoryRange {
                    memory,
                    offset: range_offset,
                    size: range_size,
                }])?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Creates a memory pool with its own block policy.
    ///
    /// # Safety
    ///
    /// Same `device` contract as [`GpuAllocator::allocate_memory`].
    pub unsafe fn create_pool(
        &self,
        device: &impl MemoryDevice<M>,
        info: &PoolCreateInfo,
    ) -> Result<PoolHandle<M>, AllocationError> {
        if info.memory_type_index as usize >= self.memory_types.len()
            || self.global_memory_type_mask & (1 << info.memory_type_index) == 0
        {
            return Err(AllocationError::InvalidArgument("invalid memory type index"));
        }
        let max_block_count = info.max_block_count.unwrap_or(usize::MAX);
        if max_block_count == 0 || info.min_block_count > max_block_count {
            return Err(AllocationError::InvalidArgument("invalid pool block counts"));
        }
        if info.block_size == Some(0) {
            return Err(AllocationError::InvalidArgument("zero pool block size"));
        }

        let heap = self.heap_of_type(info.memory_type_index);
        let preferred_block_size = info
            .block_size
            .unwrap_or_else(|| self.default_pools[info.memory_type_index as usize].preferred_block_size());

        let id = self.next_pool_id.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::new(Pool {
            id,
            block_list: BlockList::new(
                info.memory_type_index,
                heap,
                preferred_block_size,
                info.min_block_count,
                max_block_count,
                self.buffer_image_granularity,
                info.frame_in_use_count,
                info.block_size.is_some(),
                self.buffer_device_address,
                id,
            ),
        });

        if let Err(err) = pool.block_list.create_min_blocks(
            device,
            &self.budget,
            &self.allocations_remains,
        ) {
            pool.block_list
                .dispose(device, &self.budget, &self.allocations_remains);
            return Err(err);
        }

        self.pools.write().push(pool.clone());
        Ok(PoolHandle { pool })
    }

    /// Destroys an empty pool, returning its blocks to the device.
    ///
    /// # Safety
    ///
    /// Same `device` contract as [`GpuAllocator::allocate_memory`].
    pub unsafe fn destroy_pool(
        &self,
        device: &impl MemoryDevice<M>,
        handle: PoolHandle<M>,
    ) -> Result<(), AllocationError> {
        let mut pools = self.pools.write();
        let index = pools
            .iter()
            .position(|pool| pool.id == handle.pool.id)
            .ok_or(AllocationError::InvalidArgument(
                "pool does not belong to this allocator",
            ))?;

        if !handle.pool.block_list.is_empty() {
            return Err(AllocationError::InvalidState(
                "destroying a pool with live allocations",
            ));
        }

        let pool = pools.remove(index);
        pool.block_list
            .dispose(device, &self.budget, &self.allocations_remains);
        Ok(())
    }

    /// Destroys the allocator, returning every default-pool block to the
    /// device. Fails without freeing anything if user pools, dedicated
    /// allocations or block-backed allocations are still alive.
    ///
    /// # Safety
    ///
    /// Same `device` contract as [`GpuAllocator::allocate_memory`].
    pub unsafe fn dispose(self, device: &impl MemoryDevice<M>) -> Result<(), AllocationError> {
        if !self.pools.read().is_empty() {
            return Err(AllocationError::InvalidState(
                "disposing an allocator with live pools",
            ));
        }
        for set in self.dedicated.iter() {
            if !set.is_empty() {
                tracing::error!("{} dedicated allocations leaked", set.len());
                return Err(AllocationError::InvalidState(
                    "disposing an allocator with live dedicated allocations",
                ));
            }
        }
        for list in self.default_pools.iter() {
            if !list.is_empty() {
                return Err(AllocationError::InvalidState(
                    "disposing an allocator with live allocations",
                ));
            }
        }

        for list in self.default_pools.iter() {
            list.dispose(device, &self.budget, &self.allocations_remains);
        }
        Ok(())
    }

    unsafe fn allocate_memory_of_type(
        &self,
        device: &impl MemoryDevice<M>,
        index: u32,
        reqs: &MemoryRequirements,
        create_info: &AllocationCreateInfo<'_, M>,
        dedicated_info: Option<&DedicatedAllocateInfo>,
        kind: SuballocationType,
    ) -> Result<Allocation<M>, AllocationError> {
        let list = &self.default_pools[index as usize];
        let flags = create_info.flags;

        let dedicated_required = dedicated_info.map_or(false, |info| info.required);
        let dedicated_demanded =
            dedicated_required || flags.contains(AllocationCreateFlags::DEDICATED_MEMORY);

        // Lost-able allocations live in blocks only; the reclaiming
        // machinery never touches dedicated memory.
        let can_become_lost = flags.contains(AllocationCreateFlags::CAN_BECOME_LOST);

        let dedicated_preferred = !can_become_lost
            && (dedicated_info.map_or(false, |info| info.preferred)
                || create_info.usage == MemoryUsage::GpuLazilyAllocated
                || reqs.size > list.preferred_block_size() / 2);

        if dedicated_demanded {
            if flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) {
                return Err(AllocationError::OutOfDeviceMemory);
            }
            return self.allocate_dedicated(device, index, reqs, create_info, dedicated_info, kind);
        }

        if dedicated_preferred && !flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) {
            if let Ok(allocation) =
                self.allocate_dedicated(device, index, reqs, create_info, dedicated_info, kind)
            {
                return Ok(allocation);
            }
        }

        let request = self.block_request(reqs, create_info, kind, index);
        match list.allocate(device, &self.budget, &self.allocations_remains, &request) {
            Ok(allocation) => Ok(allocation),
            Err(AllocationError::OutOfDeviceMemory)
                if !flags.contains(AllocationCreateFlags::NEVER_ALLOCATE)
                    && !dedicated_preferred
                    && !can_become_lost =>
            {
                // last resort: a whole memory object for this one request
                self.allocate_dedicated(device, index, reqs, create_info, dedicated_info, kind)
            }
            Err(err) => Err(err),
        }
    }

    unsafe fn allocate_dedicated(
        &self,
        device: &impl MemoryDevice<M>,
        index: u32,
        reqs: &MemoryRequirements,
        create_info: &AllocationCreateInfo<'_, M>,
        dedicated_info: Option<&DedicatedAllocateInfo>,
        kind: SuballocationType,
    ) -> Result<Allocation<M>, AllocationError> {
        let heap = self.heap_of_type(index);
        let size = reqs.size;

        if create_info.flags.contains(AllocationCreateFlags::WITHIN_BUDGET)
            && !self.budget.fits_within_budget(device, heap, size)
        {
            return Err(AllocationError::OutOfDeviceMemory);
        }

        if !take_allocation_slot(&self.allocations_remains) {
            return Err(AllocationError::TooManyObjects);
        }
        if !self.budget.try_add_block(heap, size) {
            self.allocations_remains.fetch_add(1, Ordering::Relaxed);
            return Err(AllocationError::OutOfDeviceMemory);
        }

        let resource = dedicated_info.and_then(|info| info.resource);
        let alloc_flags = if self.buffer_device_address
            && matches!(resource, Some(DedicatedResource::Buffer(_)))
        {
            gpu_suballoc_types::AllocationFlags::DEVICE_ADDRESS
        } else {
            gpu_suballoc_types::AllocationFlags::empty()
        };

        let memory = match device.allocate_memory(size, index, alloc_flags, resource) {
            Ok(memory) => memory,
            Err(err) => {
                self.budget.sub_block(heap, size);
                self.allocations_remains.fetch_add(1, Ordering::Relaxed);
                return Err(err.into());
            }
        };

        let persistently_mapped = create_info.flags.contains(AllocationCreateFlags::MAPPED);
        let mapped_ptr = if persistently_mapped {
            match device.map_memory(&memory, 0, size) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    device.deallocate_memory(memory);
                    self.budget.sub_block(heap, size);
                    self.allocations_remains.fetch_add(1, Ordering::Relaxed);
                    return Err(match err {
                        DeviceMapError::OutOfDeviceMemory => AllocationError::OutOfDeviceMemory,
                        _ => AllocationError::OutOfHostMemory,
                    });
                }
            }
        } else {
            None
        };

        tracing::debug!(
            "Dedicated memory object of {} bytes allocated for memory type {}",
            size,
            index,
        );

        let inner = Arc::new(AllocationInner::dedicated(
            size,
            reqs.alignment,
            kind,
            create_info.user_data,
            persistently_mapped,
            self.current_frame_index(),
            index,
            memory,
            mapped_ptr,
        ));
        self.dedicated[index as usize].insert(inner.clone());
        self.budget.add_allocation(heap, size);

        Ok(Allocation { inner })
    }

    fn block_request(
        &self,
        reqs: &MemoryRequirements,
        create_info: &AllocationCreateInfo<'_, M>,
        kind: SuballocationType,
        memory_type: u32,
    ) -> AllocRequest {
        let strategy = match create_info.strategy {
            None | Some(AllocationStrategy::BestFit) => PlacementStrategy::BestFit,
            Some(AllocationStrategy::FirstFit) => PlacementStrategy::FirstFit,
            Some(AllocationStrategy::WorstFit) => PlacementStrategy::WorstFit,
        };

        AllocRequest {
            size: reqs.size,
            alignment: reqs
                .alignment
                .max(self.memory_type_min_alignment(memory_type)),
            kind,
            flags: create_info.flags,
            strategy,
            user_data: create_info.user_data,
            current_frame: self.current_frame_index(),
        }
    }

    fn validate_request(
        &self,
        reqs: &MemoryRequirements,
        create_info: &AllocationCreateInfo<'_, M>,
        dedicated_info: Option<&DedicatedAllocateInfo>,
        kind: SuballocationType,
    ) -> Result<(), AllocationError> {
        if reqs.size == 0 {
            return Err(AllocationError::InvalidArgument("zero allocation size"));
        }
        if !reqs.alignment.is_power_of_two() {
            return Err(AllocationError::InvalidArgument(
                "alignment must be a power of two",
            ));
        }
        if kind == SuballocationType::Free {
            return Err(AllocationError::InvalidArgument(
                "`Free` is not an allocatable suballocation kind",
            ));
        }

        let flags = create_info.flags;
        if flags.contains(AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::NEVER_ALLOCATE)
        {
            return Err(AllocationError::InvalidArgument(
                "`DEDICATED_MEMORY` contradicts `NEVER_ALLOCATE`",
            ));
        }
        if flags.contains(AllocationCreateFlags::MAPPED | AllocationCreateFlags::CAN_BECOME_LOST) {
            return Err(AllocationError::InvalidArgument(
                "`MAPPED` allocations cannot become lost",
            ));
        }
        if create_info.pool.is_some() {
            if flags.contains(AllocationCreateFlags::DEDICATED_MEMORY) {
                return Err(AllocationError::InvalidArgument(
                    "`DEDICATED_MEMORY` cannot be served from a pool",
                ));
            }
            if dedicated_info.map_or(false, |info| info.required) {
                return Err(AllocationError::InvalidArgument(
                    "resource requires a dedicated allocation, which a pool cannot serve",
                ));
            }
        }
        Ok(())
    }

    fn mapped_range<'a>(
        &self,
        allocation: &'a Allocation<M>,
        offset: u64,
        size: u64,
    ) -> Option<(&'a M, u64, u64)> {
        let inner = &allocation.inner;
        if inner.is_lost() {
            return None;
        }

        let props = self.memory_types[inner.memory_type() as usize].props;
        if props.contains(MemoryPropertyFlags::HOST_COHERENT) {
            return None;
        }

        let atom = self.non_coherent_atom_size;
        let alloc_size = inner.size;
        let offset = offset.min(alloc_size);
        let size = if size == u64::MAX {
            alloc_size - offset
        } else {
            size.min(alloc_size - offset)
        };
        if size == 0 {
            return None;
        }

        match &inner.flavor {
            AllocationFlavor::Block {
                block,
                offset: alloc_offset,
                ..
            } => {
                let begin = align_down(alloc_offset + offset, atom);
                let end = align_up(alloc_offset + offset + size, atom).min(block.size());
                Some((block.memory(), begin, end - begin))
            }
            AllocationFlavor::Dedicated { memory, .. } => {
                let begin = align_down(offset, atom);
                let end = align_up(offset + size, atom).min(alloc_size);
                Some((memory, begin, end - begin))
            }
        }
    }
}

/// Defragmentation is not implemented; the four entry points are declared
/// so callers can build against the final surface.
impl<M> GpuAllocator<M> {
    pub fn begin_defragmentation(&self) -> Result<(), AllocationError> {
        Err(AllocationError::Unsupported)
    }

    pub fn end_defragmentation(&self) -> Result<(), AllocationError> {
        Err(AllocationError::Unsupported)
    }

    pub fn begin_defragmentation_pass(&self) -> Result<(), AllocationError> {
        Err(AllocationError::Unsupported)
    }

    pub fn end_defragmentation_pass(&self) -> Result<(), AllocationError> {
        Err(AllocationError::Unsupported)
    }

    /// Corruption detection around allocations is not implemented.
    pub fn check_corruption(&self, _memory_type_bits: u32) -> Result<(), AllocationError> {
        Err(AllocationError::Unsupported)
    }

    /// Corruption detection around a pool's allocations is not implemented.
    pub fn check_pool_corruption(&self, _pool: &PoolHandle<M>) -> Result<(), AllocationError> {
        Err(AllocationError::Unsupported)
    }
}
