use {
    core::fmt::{self, Display},
    gpu_suballoc_types::{DeviceAllocError, DeviceMapError, OutOfMemory},
};

/// Failure of an allocation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationError {
    /// Request is malformed: zero size, non-power-of-two alignment, or a
    /// combination of flags that contradict each other.
    InvalidArgument(&'static str),

    /// No memory block could be created or reused within the device, heap
    /// limit or budget.
    OutOfDeviceMemory,

    /// Host memory exhausted.
    OutOfHostMemory,

    /// Reached the device limit on live memory objects.
    TooManyObjects,

    /// No memory type satisfies both the requirements mask and the requested
    /// usage and property flags.
    NoCompatibleMemoryType,

    /// Driver failure other than out-of-memory, with the verbatim driver
    /// result code.
    Driver(i32),

    /// Operation is valid in general but not in the current state of the
    /// allocator, e.g. destroying a pool that still has live allocations.
    InvalidState(&'static str),

    /// Entry point is declared but not implemented.
    Unsupported,
}

impl From<OutOfMemory> for AllocationError {
    fn from(err: OutOfMemory) -> Self {
        match err {
            OutOfMemory::OutOfDeviceMemory => AllocationError::OutOfDeviceMemory,
            OutOfMemory::OutOfHostMemory => AllocationError::OutOfHostMemory,
        }
    }
}

impl From<DeviceAllocError> for AllocationError {
    fn from(err: DeviceAllocError) -> Self {
        match err {
            DeviceAllocError::OutOfDeviceMemory => AllocationError::OutOfDeviceMemory,
            DeviceAllocError::OutOfHostMemory => AllocationError::OutOfHostMemory,
            DeviceAllocError::TooManyObjects => AllocationError::TooManyObjects,
            DeviceAllocError::Other(code) => AllocationError::Driver(code),
        }
    }
}

impl Display for AllocationError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::InvalidArgument(what) => {
                write!(fmt, "Invalid argument: {}", what)
            }
            AllocationError::OutOfDeviceMemory => fmt.write_str("Device memory exhausted"),
            AllocationError::OutOfHostMemory => fmt.write_str("Host memory exhausted"),
            AllocationError::TooManyObjects => {
                fmt.write_str("Reached limit on memory objects count")
            }
            AllocationError::NoCompatibleMemoryType => fmt.write_str(
                "No compatible memory types from requested mask support requested usage",
            ),
            AllocationError::Driver(code) => write!(fmt, "Driver error {}", code),
            AllocationError::InvalidState(what) => write!(fmt, "Invalid state: {}", what),
            AllocationError::Unsupported => fmt.write_str("Operation is not implemented"),
        }
    }
}

impl std::error::Error for AllocationError {}

/// Failure of mapping an allocation into host address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MapError {
    OutOfDeviceMemory,
    OutOfHostMemory,

    /// Memory type of the allocation is not host-visible.
    NonHostVisible,

    /// Driver failed to map the memory object.
    MapFailed,

    /// The allocation was reclaimed by the lost-allocation machinery.
    AllocationLost,
}

impl From<DeviceMapError> for MapError {
    fn from(err: DeviceMapError) -> Self {
        match err {
            DeviceMapError::OutOfDeviceMemory => MapError::OutOfDeviceMemory,
            DeviceMapError::OutOfHostMemory => MapError::OutOfHostMemory,
            DeviceMapError::MapFailed => MapError::MapFailed,
        }
    }
}

impl From<OutOfMemory> for MapError {
    fn from(err: OutOfMemory) -> Self {
        match err {
            OutOfMemory::OutOfDeviceMemory => MapError::OutOfDeviceMemory,
            OutOfMemory::OutOfHostMemory => MapError::OutOfHostMemory,
        }
    }
}

impl Display for MapError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfDeviceMemory => fmt.write_str("Device memory exhausted"),
            MapError::OutOfHostMemory => fmt.write_str("Host memory exhausted"),
            MapError::NonHostVisible => {
                fmt.write_str("Impossible to map non-host-visible memory")
            }
            MapError::MapFailed => fmt.write_str("Failed to map memory object"),
            MapError::AllocationLost => fmt.write_str("Allocation is lost"),
        }
    }
}

impl std::error::Error for MapError {}
