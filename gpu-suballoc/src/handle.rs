use {
    crate::{
        block::{DeviceBlock, Mapping},
        config::FRAME_INDEX_LOST,
        suballoc::SuballocationType,
    },
    core::{
        ptr::NonNull,
        sync::atomic::{AtomicU32, Ordering},
    },
    parking_lot::Mutex,
    std::sync::Arc,
};

/// Identifier of the per-memory-type default pools.
pub(crate) const DEFAULT_POOL_ID: u32 = 0;

/// Memory handed out for a single request.
///
/// The handle is not clonable and is consumed by
/// [`GpuAllocator::free_memory`], so a live handle always refers to live
/// memory unless it was reclaimed by the lost-allocation machinery.
///
/// [`GpuAllocator::free_memory`]: crate::GpuAllocator::free_memory
#[derive(Debug)]
pub struct Allocation<M> {
    pub(crate) inner: Arc<AllocationInner<M>>,
}

impl<M> Allocation<M> {
    /// Returns reference to the memory object this allocation was placed in,
    /// or `None` if the allocation is lost.
    #[inline]
    pub fn memory(&self) -> Option<&M> {
        if self.inner.is_lost() {
            return None;
        }
        match &self.inner.flavor {
            AllocationFlavor::Block { block, .. } => Some(block.memory()),
            AllocationFlavor::Dedicated { memory, .. } => Some(memory),
        }
    }

    /// Returns offset in bytes from the start of the memory object.
    /// Always zero for dedicated allocations.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.inner.offset_raw()
    }

    /// Returns size of this allocation, or zero if it is lost.
    #[inline]
    pub fn size(&self) -> u64 {
        if self.inner.is_lost() {
            0
        } else {
            self.inner.size
        }
    }

    /// Returns index of the memory type this allocation was placed in.
    #[inline]
    pub fn memory_type(&self) -> u32 {
        self.inner.memory_type()
    }

    /// Returns the user value attached at allocation time.
    #[inline]
    pub fn user_data(&self) -> u64 {
        self.inner.user_data
    }

    /// Returns the alignment the allocation was placed with.
    #[inline]
    pub fn alignment(&self) -> u64 {
        self.inner.alignment
    }

    /// Returns whether this allocation was reclaimed by an allocation made
    /// with `CAN_MAKE_OTHER_LOST`.
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.inner.is_lost()
    }

    /// Returns pointer to the persistently mapped data of this allocation,
    /// if it was allocated with `AllocationCreateFlags::MAPPED`.
    #[inline]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        if !self.inner.persistently_mapped || self.inner.is_lost() {
            return None;
        }
        self.inner.mapped_ptr()
    }
}

#[derive(Debug)]
pub(crate) struct AllocationInner<M> {
    pub(crate) size: u64,
    pub(crate) alignment: u64,
    pub(crate) kind: SuballocationType,
    pub(crate) user_data: u64,
    pub(crate) can_become_lost: bool,
    pub(crate) persistently_mapped: bool,
    pub(crate) last_use_frame: AtomicU32,
    pub(crate) flavor: AllocationFlavor<M>,
}

#[derive(Debug)]
pub(crate) enum AllocationFlavor<M> {
    Block {
        memory_type: u32,
        pool: u32,
        block: Arc<DeviceBlock<M>>,
        offset: u64,
    },
    Dedicated {
        memory_type: u32,
        memory: M,
        mapping: Mutex<Mapping>,
    },
}

impl<M> AllocationInner<M> {
    pub(crate) fn block_backed(
        size: u64,
        alignment: u64,
        kind: SuballocationType,
        user_data: u64,
        can_become_lost: bool,
        persistently_mapped: bool,
        current_frame: u32,
        memory_type: u32,
        pool: u32,
        block: Arc<DeviceBlock<M>>,
        offset: u64,
    ) -> Self {
        AllocationInner {
            size,
            alignment,
            kind,
            user_data,
            can_become_lost,
            persistently_mapped,
            last_use_frame: AtomicU32::new(current_frame),
            flavor: AllocationFlavor::Block {
                memory_type,
                pool,
                block,
                offset,
            },
        }
    }

    pub(crate) fn dedicated(
        size: u64,
        alignment: u64,
        kind: SuballocationType,
        user_data: u64,
        persistently_mapped: bool,
        current_frame: u32,
        memory_type: u32,
        memory: M,
        mapped_ptr: Option<NonNull<u8>>,
    ) -> Self {
        AllocationInner {
            size,
            alignment,
            kind,
            user_data,
            can_become_lost: false,
            persistently_mapped,
            last_use_frame: AtomicU32::new(current_frame),
            flavor: AllocationFlavor::Dedicated {
                memory_type,
                memory,
                mapping: Mutex::new(Mapping::new(mapped_ptr)),
            },
        }
    }

    #[inline]
    pub(crate) fn memory_type(&self) -> u32 {
        match self.flavor {
            AllocationFlavor::Block { memory_type, .. } => memory_type,
            AllocationFlavor::Dedicated { memory_type, .. } => memory_type,
        }
    }

    #[inline]
    pub(crate) fn offset_raw(&self) -> u64 {
        match self.flavor {
            AllocationFlavor::Block { offset, .. } => offset,
            AllocationFlavor::Dedicated { .. } => 0,
        }
    }

    #[inline]
    pub(crate) fn is_lost(&self) -> bool {
        self.can_become_lost && self.last_use_frame.load(Ordering::Acquire) == FRAME_INDEX_LOST
    }

    #[inline]
    pub(crate) fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        match &self.flavor {
            AllocationFlavor::Block { block, offset, .. } => block
                .mapped_ptr()
                .map(|ptr| unsafe { NonNull::new_unchecked(ptr.as_ptr().add(*offset as usize)) }),
            AllocationFlavor::Dedicated { mapping, .. } => mapping.lock().ptr(),
        }
    }

    /// Checks whether the allocation is eligible for reclaiming at
    /// `current_frame` with the given protection window.
    pub(crate) fn is_stale(&self, current_frame: u32, frame_in_use_count: u32) -> bool {
        let last = self.last_use_frame.load(Ordering::Acquire);
        last != FRAME_INDEX_LOST
            && (last as u64) + (frame_in_use_count as u64) < current_frame as u64
    }

    /// Attempts the publish-once transition to the lost state. Fails if the
    /// allocation was used within the protection window or is already lost.
    pub(crate) fn try_make_lost(&self, current_frame: u32, frame_in_use_count: u32) -> bool {
        debug_assert!(self.can_become_lost);
        let mut last = self.last_use_frame.load(Ordering::Acquire);
        loop {
            if last == FRAME_INDEX_LOST {
                return false;
            }
            if (last as u64) + (frame_in_use_count as u64) >= current_frame as u64 {
                return false;
            }
            match self.last_use_frame.compare_exchange_weak(
                last,
                FRAME_INDEX_LOST,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => last = observed,
            }
        }
    }

    /// Records a use of the allocation at `current_frame`.
    /// Returns `false` if the allocation is lost.
    pub(crate) fn touch(&self, current_frame: u32) -> bool {
        let mut last = self.last_use_frame.load(Ordering::Acquire);
        loop {
            if self.can_become_lost && last == FRAME_INDEX_LOST {
                return false;
            }
            if last == current_frame {
                return true;
            }
            match self.last_use_frame.compare_exchange_weak(
                last,
                current_frame,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => last = observed,
            }
        }
    }
}
