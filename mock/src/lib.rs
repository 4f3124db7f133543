//!
//! In-memory [`MemoryDevice`] used to exercise the allocator in tests.
//! Thread-safe so concurrent allocator use can be driven from plain
//! threads.
//!

use {
    core::sync::atomic::{AtomicU64, Ordering},
    gpu_suballoc_types::{
        AllocationFlags, DedicatedResource, DeviceAllocError, DeviceMapError, DeviceProperties,
        HeapBudget, MappedMemoryRange, MemoryDevice, MemoryHeap, MemoryPropertyFlags, MemoryType,
        OutOfMemory,
    },
    parking_lot::Mutex,
    slab::Slab,
    std::{borrow::Cow, ptr::NonNull},
};

struct MemoryMapping {
    content: Box<[u8]>,
}

struct MockMemory {
    memory_type: u32,
    size: u64,
    dedicated: Option<DedicatedResource>,
    mapped: Option<MemoryMapping>,
}

struct MockState {
    allocations_remains: u32,
    heap_remaining: Box<[u64]>,
    allocations: Slab<MockMemory>,
}

/// Fake memory device backed by host memory.
///
/// Enforces the same contract a driver would: allocation count limit, heap
/// capacities, mapping rules and flush/invalidate atom alignment.
pub struct MockMemoryDevice {
    memory_types: Box<[MemoryType]>,
    memory_heaps: Box<[MemoryHeap]>,
    max_memory_allocation_count: u32,
    max_memory_allocation_size: u64,
    non_coherent_atom_size: u64,
    buffer_image_granularity: u64,
    buffer_device_address: bool,
    integrated_gpu: bool,

    state: Mutex<MockState>,
    budget_override: Mutex<Option<Box<[HeapBudget]>>>,

    total_allocations_counter: AtomicU64,
    total_deallocations_counter: AtomicU64,
}

impl MockMemoryDevice {
    pub fn new(props: DeviceProperties<'_>) -> Self {
        MockMemoryDevice {
            state: Mutex::new(MockState {
                allocations_remains: props.max_memory_allocation_count,
                heap_remaining: props
                    .memory_heaps
                    .as_ref()
                    .iter()
                    .map(|heap| heap.size)
                    .collect(),
                allocations: Slab::new(),
            }),
            budget_override: Mutex::new(None),

            memory_types: props.memory_types.into_owned().into_boxed_slice(),
            memory_heaps: props.memory_heaps.into_owned().into_boxed_slice(),
            max_memory_allocation_count: props.max_memory_allocation_count,
            max_memory_allocation_size: props.max_memory_allocation_size,
            non_coherent_atom_size: props.non_coherent_atom_size,
            buffer_image_granularity: props.buffer_image_granularity,
            buffer_device_address: props.buffer_device_address,
            integrated_gpu: props.integrated_gpu,

            total_allocations_counter: AtomicU64::new(0),
            total_deallocations_counter: AtomicU64::new(0),
        }
    }

    pub fn props(&self) -> DeviceProperties<'_> {
        DeviceProperties {
            memory_types: Cow::Borrowed(&self.memory_types),
            memory_heaps: Cow::Borrowed(&self.memory_heaps),
            max_memory_allocation_count: self.max_memory_allocation_count,
            max_memory_allocation_size: self.max_memory_allocation_size,
            non_coherent_atom_size: self.non_coherent_atom_size,
            buffer_image_granularity: self.buffer_image_granularity,
            buffer_device_address: self.buffer_device_address,
            integrated_gpu: self.integrated_gpu,
        }
    }

    /// Number of memory objects allocated over the device's lifetime.
    pub fn total_allocations(&self) -> u64 {
        self.total_allocations_counter.load(Ordering::Relaxed)
    }

    /// Number of memory objects returned over the device's lifetime.
    pub fn total_deallocations(&self) -> u64 {
        self.total_deallocations_counter.load(Ordering::Relaxed)
    }

    /// Number of memory objects currently alive.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Bytes currently allocated from the given heap.
    pub fn heap_usage(&self, heap: usize) -> u64 {
        self.memory_heaps[heap].size - self.state.lock().heap_remaining[heap]
    }

    /// Size of the live memory object behind `memory`.
    pub fn memory_size(&self, memory: usize) -> u64 {
        self.state.lock().allocations[memory].size
    }

    /// Dedicated-resource descriptor the memory object was allocated with.
    pub fn dedicated_resource(&self, memory: usize) -> Option<DedicatedResource> {
        self.state.lock().allocations[memory].dedicated
    }

    /// Makes `query_memory_budget` report the given values instead of the
    /// real heap usage.
    pub fn override_budget(&self, budgets: &[HeapBudget]) {
        assert_eq!(budgets.len(), self.memory_heaps.len());
        *self.budget_override.lock() = Some(budgets.into());
    }
}

impl MemoryDevice<usize> for MockMemoryDevice {
    unsafe fn allocate_memory(
        &self,
        size: u64,
        memory_type: u32,
        flags: AllocationFlags,
        dedicated: Option<DedicatedResource>,
    ) -> Result<usize, DeviceAllocError> {
        assert!(
            self.buffer_device_address || !flags.contains(AllocationFlags::DEVICE_ADDRESS),
            "`AllocationFlags::DEVICE_ADDRESS` requires `DeviceProperties::buffer_device_address`",
        );
        assert!(
            size <= self.max_memory_allocation_size,
            "allocation size exceeds device limit"
        );

        let mut state = self.state.lock();

        if state.allocations_remains == 0 {
            return Err(DeviceAllocError::TooManyObjects);
        }

        let heap = self.memory_types[memory_type as usize].heap as usize;
        if state.heap_remaining[heap] < size {
            return Err(DeviceAllocError::OutOfDeviceMemory);
        }

        state.allocations_remains -= 1;
        state.heap_remaining[heap] -= size;
        self.total_allocations_counter.fetch_add(1, Ordering::Relaxed);

        tracing::debug!("Memory object of {} bytes allocated", size);
        Ok(state.allocations.insert(MockMemory {
            memory_type,
            size,
            dedicated,
            mapped: None,
        }))
    }

    unsafe fn deallocate_memory(&self, memory: usize) {
        let mut state = self.state.lock();
        let memory = state.allocations.remove(memory);
        assert!(
            memory.mapped.is_none(),
            "memory object deallocated while mapped"
        );

        state.allocations_remains += 1;
        let heap = self.memory_types[memory.memory_type as usize].heap as usize;
        state.heap_remaining[heap] += memory.size;
        self.total_deallocations_counter
            .fetch_add(1, Ordering::Relaxed);

        tracing::debug!("Memory object deallocated");
    }

    unsafe fn map_memory(
        &self,
        memory: &usize,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceMapError> {
        let mut state = self.state.lock();
        let memory = state
            .allocations
            .get_mut(*memory)
            .expect("non-existing memory object");

        assert!(
            self.memory_types[memory.memory_type as usize]
                .props
                .contains(MemoryPropertyFlags::HOST_VISIBLE),
            "attempt to map non-host-visible memory"
        );
        assert!(memory.mapped.is_none(), "already mapped");
        assert_ne!(size, 0, "mapping size must be greater than 0");
        assert!(offset < memory.size, "mapping offset is out of bounds");
        assert!(
            size <= memory.size - offset,
            "mapped range is out of bounds"
        );

        let size = usize::try_from(size).map_err(|_| DeviceMapError::OutOfHostMemory)?;
        let mapping = memory.mapped.insert(MemoryMapping {
            content: vec![0; size].into_boxed_slice(),
        });

        tracing::debug!("Memory object mapped");
        Ok(NonNull::new(mapping.content.as_mut_ptr()).unwrap())
    }

    unsafe fn unmap_memory(&self, memory: &usize) {
        let mut state = self.state.lock();
        let memory = state
            .allocations
            .get_mut(*memory)
            .expect("non-existing memory object");
        assert!(memory.mapped.take().is_some(), "was not mapped");
        tracing::debug!("Memory object unmapped");
    }

    unsafe fn flush_memory_ranges(
        &self,
        ranges: &[MappedMemoryRange<'_, usize>],
    ) -> Result<(), OutOfMemory> {
        let state = self.state.lock();
        for range in ranges {
            self.check_mapped_range(&state, range);
        }
        Ok(())
    }

    unsafe fn invalidate_memory_ranges(
        &self,
        ranges: &[MappedMemoryRange<'_, usize>],
    ) -> Result<(), OutOfMemory> {
        let state = self.state.lock();
        for range in ranges {
            self.check_mapped_range(&state, range);
        }
        Ok(())
    }

    fn query_memory_budget(&self, budgets: &mut [HeapBudget]) -> Result<(), OutOfMemory> {
        assert_eq!(budgets.len(), self.memory_heaps.len());

        if let Some(overridden) = self.budget_override.lock().as_deref() {
            budgets.copy_from_slice(overridden);
            return Ok(());
        }

        let state = self.state.lock();
        for (heap, budget) in budgets.iter_mut().enumerate() {
            *budget = HeapBudget {
                usage: self.memory_heaps[heap].size - state.heap_remaining[heap],
                budget: self.memory_heaps[heap].size,
            };
        }
        Ok(())
    }
}

impl MockMemoryDevice {
    fn check_mapped_range(&self, state: &MockState, range: &MappedMemoryRange<'_, usize>) {
        let memory = state
            .allocations
            .get(*range.memory)
            .expect("non-existing memory object");
        assert!(memory.mapped.is_some(), "memory object is not mapped");

        let coherent = self.memory_types[memory.memory_type as usize]
            .props
            .contains(MemoryPropertyFlags::HOST_COHERENT);
        if coherent {
            tracing::warn!("Flushing or invalidating host-coherent memory");
        }

        assert!(
            range.offset < memory.size && range.size <= memory.size - range.offset,
            "range is out of memory object bounds"
        );
        assert_eq!(
            range.offset % self.non_coherent_atom_size,
            0,
            "`offset` must be a multiple of `non_coherent_atom_size`"
        );
        assert!(
            range.size % self.non_coherent_atom_size == 0
                || range.offset + range.size == memory.size,
            "`size` must be a multiple of `non_coherent_atom_size` or reach the end of the memory object"
        );
    }
}
