bitflags::bitflags! {
    /// Memory property flags of a memory type, mirroring the flag vector the
    /// driver reports per type.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        /// Most efficient for device access.
        const DEVICE_LOCAL = 0x01;

        /// Can be mapped into host address space.
        const HOST_VISIBLE = 0x02;

        /// Host writes and device reads do not require flush/invalidate.
        const HOST_COHERENT = 0x04;

        /// Cached on the host. Host reads from uncached memory are slow.
        const HOST_CACHED = 0x08;

        /// May be committed lazily by the driver.
        /// Cannot be mapped and cannot back host-accessed resources.
        const LAZILY_ALLOCATED = 0x10;

        /// Only protected operations may access this memory.
        const PROTECTED = 0x20;

        /// Device-coherent access (AMD extension).
        const DEVICE_COHERENT_AMD = 0x40;

        /// Device-uncached access (AMD extension).
        const DEVICE_UNCACHED_AMD = 0x80;
    }
}

bitflags::bitflags! {
    /// Flags attached to a single device allocation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AllocationFlags: u8 {
        /// Memory may be used to retrieve a device address for buffers
        /// placed in it.
        const DEVICE_ADDRESS = 0x1;
    }
}

/// One memory type reported by the device.
///
/// Index of the type in `DeviceProperties::memory_types` is the index
/// expected by `MemoryDevice::allocate_memory`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryType {
    /// Index of the heap this type allocates from.
    pub heap: u32,

    /// Property flags of this type.
    pub props: MemoryPropertyFlags,
}

/// One memory heap reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryHeap {
    /// Size of the heap in bytes.
    pub size: u64,
}

/// Driver-reported memory requirements of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryRequirements {
    /// Required size of the allocation in bytes.
    pub size: u64,

    /// Required alignment of the allocation offset. Power of two.
    pub alignment: u64,

    /// Bitmask of memory type indices the resource may be bound to.
    pub allowed_type_mask: u32,
}

/// Native handle of the resource a dedicated allocation will be bound to,
/// attached to the driver allocate call so the driver can specialize the
/// allocation for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DedicatedResource {
    /// Native buffer handle.
    Buffer(u64),

    /// Native image handle.
    Image(u64),
}
