use {
    crate::{error::MapError, suballoc::BlockMetadata},
    core::{
        ptr::NonNull,
        sync::atomic::{AtomicU64, Ordering},
    },
    gpu_suballoc_types::MemoryDevice,
    parking_lot::Mutex,
};

/// Reference-counted host mapping of one memory object.
#[derive(Debug)]
pub(crate) struct Mapping {
    count: u32,
    ptr: Option<NonNull<u8>>,
}

// The pointer refers to a driver-owned mapping and is only dereferenced by
// the caller; the mapping state itself is always behind a mutex.
unsafe impl Send for Mapping {}

impl Mapping {
    pub(crate) fn new(ptr: Option<NonNull<u8>>) -> Self {
        Mapping {
            count: ptr.is_some() as u32,
            ptr,
        }
    }

    pub(crate) fn ptr(&self) -> Option<NonNull<u8>> {
        self.ptr
    }

    /// Bumps the reference count if a mapping is live.
    pub(crate) fn acquire(&mut self) -> Option<NonNull<u8>> {
        self.ptr.map(|ptr| {
            self.count += 1;
            ptr
        })
    }

    /// Records the first mapping.
    pub(crate) fn init(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.ptr.is_none());
        self.count = 1;
        self.ptr = Some(ptr);
    }

    /// Drops one reference. Returns `true` when the driver mapping must be
    /// released.
    pub(crate) fn release(&mut self) -> bool {
        debug_assert!(self.count > 0, "unbalanced unmap");
        self.count -= 1;
        if self.count == 0 {
            self.ptr = None;
            true
        } else {
            false
        }
    }

    /// Clears the mapping unconditionally. Returns `true` if a driver
    /// mapping was live.
    pub(crate) fn clear(&mut self) -> bool {
        self.count = 0;
        self.ptr.take().is_some()
    }
}

/// One driver memory allocation owned by a block list, together with its
/// sub-allocation state and host mapping.
#[derive(Debug)]
pub(crate) struct DeviceBlock<M> {
    memory: M,
    size: u64,
    memory_type: u32,
    id: u64,
    /// Snapshot of `metadata.sum_free()`, readable without the metadata
    /// lock so the owning list can keep its blocks ordered.
    sum_free: AtomicU64,
    pub(crate) metadata: Mutex<BlockMetadata<M>>,
    mapping: Mutex<Mapping>,
}

impl<M> DeviceBlock<M> {
    pub(crate) fn new(memory: M, size: u64, memory_type: u32, id: u64) -> Self {
        DeviceBlock {
            memory,
            size,
            memory_type,
            id,
            sum_free: AtomicU64::new(size),
            metadata: Mutex::new(BlockMetadata::new(size)),
            mapping: Mutex::new(Mapping::new(None)),
        }
    }

    #[inline]
    pub(crate) fn memory(&self) -> &M {
        &self.memory
    }

    #[inline]
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub(crate) fn memory_type(&self) -> u32 {
        self.memory_type
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn sum_free_cached(&self) -> u64 {
        self.sum_free.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn update_sum_free(&self, value: u64) {
        self.sum_free.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapping.lock().ptr()
    }

    /// Maps the whole block, or bumps the reference count of a live
    /// mapping. Returns the pointer to the start of the block.
    pub(crate) fn map(&self, device: &impl MemoryDevice<M>) -> Result<NonNull<u8>, MapError> {
        let mut mapping = self.mapping.lock();
        if let Some(ptr) = mapping.acquire() {
            return Ok(ptr);
        }
        let ptr = unsafe { device.map_memory(&self.memory, 0, self.size) }?;
        mapping.init(ptr);
        Ok(ptr)
    }

    /// Releases one map reference, unmapping the block on the last one.
    pub(crate) fn unmap(&self, device: &impl MemoryDevice<M>) {
        let mut mapping = self.mapping.lock();
        if mapping.release() {
            unsafe { device.unmap_memory(&self.memory) };
        }
    }

    /// Drops any live mapping. Must be called before the block's memory is
    /// returned to the driver.
    pub(crate) fn unmap_for_destroy(&self, device: &impl MemoryDevice<M>) {
        let mut mapping = self.mapping.lock();
        if mapping.clear() {
            unsafe { device.unmap_memory(&self.memory) };
        }
    }
}
