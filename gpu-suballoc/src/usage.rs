use gpu_suballoc_types::{MemoryPropertyFlags, MemoryType};

/// Intended usage of an allocation, translated into memory property
/// requirements and preferences.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// No hint; only the explicit flag sets are considered.
    #[default]
    Unknown,

    /// Resources written and read by the device only.
    GpuOnly,

    /// Staging and readback memory that the device touches rarely.
    CpuOnly,

    /// Memory written by the host every frame and read by the device.
    CpuToGpu,

    /// Memory written by the device and read back on the host.
    GpuToCpu,

    /// Host-side copies of resources, without device access on a hot path.
    CpuCopy,

    /// Transient attachments that may never be backed by physical memory.
    GpuLazilyAllocated,
}

/// Hard and soft property filters a request resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FlagSets {
    pub required: MemoryPropertyFlags,
    pub preferred: MemoryPropertyFlags,
    pub not_preferred: MemoryPropertyFlags,
}

/// Expands a usage hint and explicit flag sets into the filters used by
/// [`find_memory_type_index`].
pub(crate) fn derive_flag_sets(
    usage: MemoryUsage,
    required_flags: MemoryPropertyFlags,
    preferred_flags: MemoryPropertyFlags,
    integrated_gpu: bool,
) -> FlagSets {
    let mut required = required_flags;
    let mut preferred = preferred_flags;
    let mut not_preferred = MemoryPropertyFlags::empty();

    match usage {
        MemoryUsage::Unknown => {}
        MemoryUsage::GpuOnly => {
            if !integrated_gpu || !preferred.contains(MemoryPropertyFlags::HOST_VISIBLE) {
                preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
            }
        }
        MemoryUsage::CpuOnly => {
            required |= MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        }
        MemoryUsage::CpuToGpu => {
            required |= MemoryPropertyFlags::HOST_VISIBLE;
            if !integrated_gpu || !preferred.contains(MemoryPropertyFlags::HOST_VISIBLE) {
                preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
            }
        }
        MemoryUsage::GpuToCpu => {
            required |= MemoryPropertyFlags::HOST_VISIBLE;
            preferred |= MemoryPropertyFlags::HOST_CACHED;
        }
        MemoryUsage::CpuCopy => {
            not_preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
        }
        MemoryUsage::GpuLazilyAllocated => {
            required |= MemoryPropertyFlags::LAZILY_ALLOCATED;
        }
    }

    // AMD coherent memory is avoided unless the request asks for it.
    let amd = MemoryPropertyFlags::DEVICE_COHERENT_AMD | MemoryPropertyFlags::DEVICE_UNCACHED_AMD;
    if !(required | preferred).intersects(amd) {
        not_preferred |= MemoryPropertyFlags::DEVICE_COHERENT_AMD;
    }

    FlagSets {
        required,
        preferred,
        not_preferred,
    }
}

/// Picks the cheapest memory type among `type_mask` that carries every
/// required flag. Cost counts missing preferred flags and present
/// not-preferred flags; the lowest index wins ties.
pub(crate) fn find_memory_type_index(
    type_mask: u32,
    sets: &FlagSets,
    memory_types: &[MemoryType],
) -> Option<u32> {
    let mut best: Option<(u32, u32)> = None;

    for (index, memory_type) in memory_types.iter().enumerate() {
        if type_mask & (1u32 << index) == 0 {
            continue;
        }
        let flags = memory_type.props;
        if !flags.contains(sets.required) {
            continue;
        }

        let cost = (sets.preferred & !flags).bits().count_ones()
            + (flags & sets.not_preferred).bits().count_ones();
        if cost == 0 {
            return Some(index as u32);
        }
        if best.map_or(true, |(_, best_cost)| cost < best_cost) {
            best = Some((index as u32, cost));
        }
    }

    best.map(|(index, _)| index)
}
