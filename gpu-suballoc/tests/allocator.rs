use {
    gpu_suballoc::{
        AllocationCreateFlags, AllocationCreateInfo, AllocationError, Config, DedicatedAllocateInfo,
        DedicatedResource, DeviceProperties, GpuAllocator, MemoryHeap, MemoryPropertyFlags,
        MemoryRequirements, MemoryType, MemoryUsage, PoolCreateInfo, SuballocationType,
    },
    gpu_suballoc_mock::MockMemoryDevice,
    std::borrow::Cow,
};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

fn device() -> MockMemoryDevice {
    MockMemoryDevice::new(DeviceProperties {
        memory_types: Cow::Borrowed(&[
            MemoryType {
                heap: 0,
                props: MemoryPropertyFlags::DEVICE_LOCAL,
            },
            MemoryType {
                heap: 1,
                props: MemoryPropertyFlags::HOST_VISIBLE
                    .union(MemoryPropertyFlags::HOST_COHERENT),
            },
            MemoryType {
                heap: 1,
                props: MemoryPropertyFlags::HOST_VISIBLE
                    .union(MemoryPropertyFlags::HOST_CACHED),
            },
        ]),
        memory_heaps: Cow::Borrowed(&[MemoryHeap { size: GIB }, MemoryHeap { size: GIB }]),
        max_memory_allocation_count: 4096,
        max_memory_allocation_size: GIB,
        non_coherent_atom_size: 64,
        buffer_image_granularity: 1024,
        buffer_device_address: false,
        integrated_gpu: false,
    })
}

fn reqs(size: u64, alignment: u64) -> MemoryRequirements {
    MemoryRequirements {
        size,
        alignment,
        allowed_type_mask: !0,
    }
}

fn gpu_only<'a>() -> AllocationCreateInfo<'a, usize> {
    AllocationCreateInfo {
        usage: MemoryUsage::GpuOnly,
        ..AllocationCreateInfo::default()
    }
}

#[test]
fn block_reuse_and_retirement() {
    let device = device();
    let allocator = GpuAllocator::new(Config::default(), device.props());

    let a = unsafe {
        allocator.allocate_memory(&device, &reqs(MIB, 64), &gpu_only(), None, SuballocationType::Buffer)
    }
    .unwrap();
    let b = unsafe {
        allocator.allocate_memory(&device, &reqs(MIB, 64), &gpu_only(), None, SuballocationType::Buffer)
    }
    .unwrap();

    // both requests share one 128 MiB block of the 1 GiB heap
    assert_eq!(device.live_allocations(), 1);
    assert_eq!(device.heap_usage(0), 128 * MIB);
    assert_eq!(a.memory(), b.memory());
    assert_eq!(a.offset(), 0);
    assert_eq!(b.offset(), MIB);

    let budget = allocator.heap_budgets()[0];
    assert_eq!(budget.block_bytes, 128 * MIB);
    assert_eq!(budget.allocation_bytes, 2 * MIB);

    unsafe { allocator.free_memory(&device, a) };
    assert_eq!(device.live_allocations(), 1);

    // the emptied block is returned to the device
    unsafe { allocator.free_memory(&device, b) };
    assert_eq!(device.live_allocations(), 0);
    assert_eq!(allocator.heap_budgets()[0].block_bytes, 0);

    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn large_request_escalates_to_dedicated() {
    let device = device();
    let allocator = GpuAllocator::new(Config::default(), device.props());

    // 200 MiB is more than half the 128 MiB preferred block size
    let allocation = unsafe {
        allocator.allocate_memory(
            &device,
            &reqs(200 * MIB, 64),
            &gpu_only(),
            None,
            SuballocationType::Buffer,
        )
    }
    .unwrap();

    assert_eq!(allocation.offset(), 0);
    assert_eq!(device.live_allocations(), 1);
    assert_eq!(device.memory_size(*allocation.memory().unwrap()), 200 * MIB);

    let budget = allocator.heap_budgets()[0];
    assert_eq!(budget.block_bytes, 200 * MIB);
    assert_eq!(budget.allocation_bytes, 200 * MIB);

    unsafe { allocator.free_memory(&device, allocation) };
    assert_eq!(device.live_allocations(), 0);
    assert_eq!(allocator.heap_budgets()[0].block_bytes, 0);

    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn dedicated_resource_is_forwarded() {
    let device = device();
    let allocator = GpuAllocator::new(Config::default(), device.props());

    let allocation = unsafe {
        allocator.allocate_memory(
            &device,
            &reqs(MIB, 64),
            &gpu_only(),
            Some(&DedicatedAllocateInfo {
                resource: Some(DedicatedResource::Image(0x1234)),
                required: true,
                preferred: false,
            }),
            SuballocationType::ImageOptimal,
        )
    }
    .unwrap();

    assert_eq!(
        device.dedicated_resource(*allocation.memory().unwrap()),
        Some(DedicatedResource::Image(0x1234)),
    );

    unsafe { allocator.free_memory(&device, allocation) };
    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn heap_limit_blocks_creation() {
    let device = device();
    let mut config = Config::default();
    config.heap_size_limits = Some(Box::new([Some(512 * MIB), None]));
    let allocator = GpuAllocator::new(config, device.props());

    // two dedicated allocations bring the heap to 500 MiB
    let a = unsafe {
        allocator.allocate_memory(&device, &reqs(250 * MIB, 64), &gpu_only(), None, SuballocationType::Buffer)
    }
    .unwrap();
    let b = unsafe {
        allocator.allocate_memory(&device, &reqs(250 * MIB, 64), &gpu_only(), None, SuballocationType::Buffer)
    }
    .unwrap();
    assert_eq!(allocator.heap_budgets()[0].block_bytes, 500 * MIB);

    // 64 MiB needs a new block; every candidate size exceeds the limit.
    // The mask pins the request to the limited heap.
    let pinned = MemoryRequirements {
        size: 64 * MIB,
        alignment: 64,
        allowed_type_mask: 1,
    };
    let denied = unsafe {
        allocator.allocate_memory(&device, &pinned, &gpu_only(), None, SuballocationType::Buffer)
    };
    assert_eq!(denied.unwrap_err(), AllocationError::OutOfDeviceMemory);
    assert_eq!(allocator.heap_budgets()[0].block_bytes, 500 * MIB);

    unsafe { allocator.free_memory(&device, a) };
    unsafe { allocator.free_memory(&device, b) };
    assert_eq!(allocator.heap_budgets()[0].block_bytes, 0);

    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn losing_sweep_reclaims_whole_pool_block() {
    let device = device();
    let mut config = Config::default();
    config.frame_in_use_count = 2;
    let allocator = GpuAllocator::new(config, device.props());

    let pool = unsafe {
        allocator.create_pool(
            &device,
            &PoolCreateInfo {
                memory_type_index: 0,
                block_size: Some(MIB),
                min_block_count: 0,
                max_block_count: Some(1),
                frame_in_use_count: 2,
            },
        )
    }
    .unwrap();

    let lossy = AllocationCreateInfo {
        flags: AllocationCreateFlags::CAN_BECOME_LOST,
        pool: Some(&pool),
        ..AllocationCreateInfo::default()
    };

    allocator.set_current_frame_index(3);
    let x = unsafe {
        allocator.allocate_memory(&device, &reqs(MIB / 2, 64), &lossy, None, SuballocationType::Buffer)
    }
    .unwrap();
    allocator.set_current_frame_index(4);
    let y = unsafe {
        allocator.allocate_memory(&device, &reqs(MIB / 2, 64), &lossy, None, SuballocationType::Buffer)
    }
    .unwrap();
    assert!(!x.is_lost() && !y.is_lost());

    // the pool's only block is full; reclaiming is the only way in
    allocator.set_current_frame_index(10);
    let z = unsafe {
        allocator.allocate_memory(
            &device,
            &reqs(MIB, 64),
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::CAN_MAKE_OTHER_LOST,
                pool: Some(&pool),
                ..AllocationCreateInfo::default()
            },
            None,
            SuballocationType::Buffer,
        )
    }
    .unwrap();

    assert_eq!(z.offset(), 0);
    assert_eq!(z.size(), MIB);
    assert!(x.is_lost() && y.is_lost());
    assert_eq!(x.size(), 0);
    assert_eq!(x.memory(), None);

    // freeing lost handles is a no-op
    unsafe { allocator.free_memory(&device, x) };
    unsafe { allocator.free_memory(&device, y) };

    unsafe { allocator.free_memory(&device, z) };
    unsafe { allocator.destroy_pool(&device, pool) }.unwrap();
    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn touched_allocations_survive_the_sweep() {
    let device = device();
    let mut config = Config::default();
    config.frame_in_use_count = 2;
    let allocator = GpuAllocator::new(config, device.props());

    let pool = unsafe {
        allocator.create_pool(
            &device,
            &PoolCreateInfo {
                memory_type_index: 0,
                block_size: Some(MIB),
                max_block_count: Some(1),
                frame_in_use_count: 2,
                ..PoolCreateInfo::default()
            },
        )
    }
    .unwrap();

    let lossy = AllocationCreateInfo {
        flags: AllocationCreateFlags::CAN_BECOME_LOST,
        pool: Some(&pool),
        ..AllocationCreateInfo::default()
    };

    allocator.set_current_frame_index(3);
    let x = unsafe {
        allocator.allocate_memory(&device, &reqs(MIB, 64), &lossy, None, SuballocationType::Buffer)
    }
    .unwrap();

    // recently used allocations are protected
    allocator.set_current_frame_index(9);
    assert!(allocator.touch_allocation(&x));
    allocator.set_current_frame_index(10);

    let denied = unsafe {
        allocator.allocate_memory(
            &device,
            &reqs(MIB, 64),
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::CAN_MAKE_OTHER_LOST,
                pool: Some(&pool),
                ..AllocationCreateInfo::default()
            },
            None,
            SuballocationType::Buffer,
        )
    };
    assert_eq!(denied.unwrap_err(), AllocationError::OutOfDeviceMemory);
    assert!(!x.is_lost());

    unsafe { allocator.free_memory(&device, x) };
    unsafe { allocator.destroy_pool(&device, pool) }.unwrap();
    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn pool_wide_sweep_reclaims_stale_allocations() {
    let device = device();
    let allocator = GpuAllocator::new(Config::default(), device.props());

    let pool = unsafe {
        allocator.create_pool(
            &device,
            &PoolCreateInfo {
                memory_type_index: 0,
                block_size: Some(MIB),
                max_block_count: Some(2),
                frame_in_use_count: 1,
                ..PoolCreateInfo::default()
            },
        )
    }
    .unwrap();

    let lossy = AllocationCreateInfo {
        flags: AllocationCreateFlags::CAN_BECOME_LOST,
        pool: Some(&pool),
        ..AllocationCreateInfo::default()
    };

    allocator.set_current_frame_index(1);
    let x = unsafe {
        allocator.allocate_memory(&device, &reqs(MIB / 4, 64), &lossy, None, SuballocationType::Buffer)
    }
    .unwrap();
    let y = unsafe {
        allocator.allocate_memory(&device, &reqs(MIB / 4, 64), &lossy, None, SuballocationType::Buffer)
    }
    .unwrap();

    // both fall out of the frame-in-use window by frame 5
    allocator.set_current_frame_index(5);
    assert_eq!(allocator.make_pool_allocations_lost(&pool), 2);
    assert!(x.is_lost() && y.is_lost());
    assert_eq!(allocator.pool_statistics(&pool).allocation_count, 0);

    unsafe { allocator.free_memory(&device, x) };
    unsafe { allocator.free_memory(&device, y) };
    unsafe { allocator.destroy_pool(&device, pool) }.unwrap();
    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn pool_lifecycle() {
    let device = device();
    let allocator = GpuAllocator::new(Config::default(), device.props());

    let pool = unsafe {
        allocator.create_pool(
            &device,
            &PoolCreateInfo {
                memory_type_index: 0,
                block_size: Some(4 * MIB),
                min_block_count: 2,
                max_block_count: Some(4),
                frame_in_use_count: 0,
            },
        )
    }
    .unwrap();
    assert_eq!(device.live_allocations(), 2);

    let allocation = unsafe {
        allocator.allocate_memory(
            &device,
            &reqs(MIB, 64),
            &AllocationCreateInfo {
                pool: Some(&pool),
                ..AllocationCreateInfo::default()
            },
            None,
            SuballocationType::Buffer,
        )
    }
    .unwrap();

    let stats = allocator.pool_statistics(&pool);
    assert_eq!(stats.block_count, 2);
    assert_eq!(stats.allocation_count, 1);
    assert_eq!(stats.size, 8 * MIB);
    assert_eq!(stats.unused_size, 7 * MIB);

    // a pool with live allocations cannot be destroyed
    let denied = unsafe { allocator.destroy_pool(&device, pool.clone()) };
    assert!(matches!(denied, Err(AllocationError::InvalidState(_))));

    unsafe { allocator.free_memory(&device, allocation) };
    unsafe { allocator.destroy_pool(&device, pool) }.unwrap();
    assert_eq!(device.live_allocations(), 0);

    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn invalid_requests_are_rejected() {
    let device = device();
    let allocator = GpuAllocator::new(Config::default(), device.props());

    let zero = unsafe {
        allocator.allocate_memory(&device, &reqs(0, 64), &gpu_only(), None, SuballocationType::Buffer)
    };
    assert!(matches!(zero, Err(AllocationError::InvalidArgument(_))));

    let misaligned = unsafe {
        allocator.allocate_memory(&device, &reqs(MIB, 3), &gpu_only(), None, SuballocationType::Buffer)
    };
    assert!(matches!(misaligned, Err(AllocationError::InvalidArgument(_))));

    let contradicting = unsafe {
        allocator.allocate_memory(
            &device,
            &reqs(MIB, 64),
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::DEDICATED_MEMORY
                    | AllocationCreateFlags::NEVER_ALLOCATE,
                ..AllocationCreateInfo::default()
            },
            None,
            SuballocationType::Buffer,
        )
    };
    assert!(matches!(contradicting, Err(AllocationError::InvalidArgument(_))));

    let mapped_lost = unsafe {
        allocator.allocate_memory(
            &device,
            &reqs(MIB, 64),
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::MAPPED | AllocationCreateFlags::CAN_BECOME_LOST,
                ..AllocationCreateInfo::default()
            },
            None,
            SuballocationType::Buffer,
        )
    };
    assert!(matches!(mapped_lost, Err(AllocationError::InvalidArgument(_))));

    // nothing exists yet, so NEVER_ALLOCATE cannot be served
    let never = unsafe {
        allocator.allocate_memory(
            &device,
            &reqs(MIB, 64),
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::NEVER_ALLOCATE,
                ..AllocationCreateInfo::default()
            },
            None,
            SuballocationType::Buffer,
        )
    };
    assert_eq!(never.unwrap_err(), AllocationError::OutOfDeviceMemory);

    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn type_selection_is_deterministic_and_usage_driven() {
    let device = device();
    let allocator = GpuAllocator::new(Config::default(), device.props());

    let gpu = allocator
        .find_memory_type_index(!0, &gpu_only())
        .unwrap();
    assert_eq!(gpu, 0);

    let upload = allocator
        .find_memory_type_index(
            !0,
            &AllocationCreateInfo {
                usage: MemoryUsage::CpuOnly,
                ..AllocationCreateInfo::default()
            },
        )
        .unwrap();
    assert_eq!(upload, 1);

    let readback = allocator
        .find_memory_type_index(
            !0,
            &AllocationCreateInfo {
                usage: MemoryUsage::GpuToCpu,
                ..AllocationCreateInfo::default()
            },
        )
        .unwrap();
    assert_eq!(readback, 2);

    for _ in 0..32 {
        assert_eq!(allocator.find_memory_type_index(!0, &gpu_only()), Ok(gpu));
    }

    let impossible = allocator.find_memory_type_index(
        !0,
        &AllocationCreateInfo {
            usage: MemoryUsage::GpuLazilyAllocated,
            ..AllocationCreateInfo::default()
        },
    );
    assert_eq!(impossible.unwrap_err(), AllocationError::NoCompatibleMemoryType);

    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn mapping_is_reference_counted() {
    let device = device();
    let allocator = GpuAllocator::new(Config::default(), device.props());

    let host_visible = AllocationCreateInfo {
        usage: MemoryUsage::CpuOnly,
        ..AllocationCreateInfo::default()
    };
    let a = unsafe {
        allocator.allocate_memory(&device, &reqs(4096, 64), &host_visible, None, SuballocationType::Buffer)
    }
    .unwrap();
    let b = unsafe {
        allocator.allocate_memory(&device, &reqs(4096, 64), &host_visible, None, SuballocationType::Buffer)
    }
    .unwrap();
    assert_eq!(a.memory(), b.memory());

    let ptr_a = unsafe { allocator.map_memory(&device, &a) }.unwrap();
    let ptr_b = unsafe { allocator.map_memory(&device, &b) }.unwrap();
    assert_eq!(
        unsafe { ptr_a.as_ptr().add((b.offset() - a.offset()) as usize) },
        ptr_b.as_ptr(),
    );

    unsafe { allocator.unmap_memory(&device, &a) };
    // the block stays mapped until the last user unmaps
    let ptr_b2 = unsafe { allocator.map_memory(&device, &b) }.unwrap();
    assert_eq!(ptr_b.as_ptr(), ptr_b2.as_ptr());
    unsafe { allocator.unmap_memory(&device, &b) };
    unsafe { allocator.unmap_memory(&device, &b) };

    unsafe { allocator.free_memory(&device, a) };
    unsafe { allocator.free_memory(&device, b) };
    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn persistent_mapping_and_flush() {
    let device = device();
    let allocator = GpuAllocator::new(Config::default(), device.props());

    // type 2 is host-visible but not coherent
    let info = AllocationCreateInfo {
        flags: AllocationCreateFlags::MAPPED,
        required_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED,
        ..AllocationCreateInfo::default()
    };
    let allocation = unsafe {
        allocator.allocate_memory(&device, &reqs(1000, 64), &info, None, SuballocationType::Buffer)
    }
    .unwrap();
    assert_eq!(allocation.memory_type(), 2);
    assert!(allocation.mapped_ptr().is_some());

    // ranges are rounded to the non-coherent atom before reaching the
    // device, which asserts on misaligned ranges
    unsafe { allocator.flush_allocation(&device, &allocation, 10, 20) }.unwrap();
    unsafe { allocator.invalidate_allocation(&device, &allocation, 100, u64::MAX) }.unwrap();
    unsafe { allocator.flush_allocation(&device, &allocation, 0, u64::MAX) }.unwrap();

    unsafe { allocator.free_memory(&device, allocation) };
    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn allocation_count_limit_is_enforced() {
    let device = MockMemoryDevice::new(DeviceProperties {
        memory_types: Cow::Borrowed(&[MemoryType {
            heap: 0,
            props: MemoryPropertyFlags::DEVICE_LOCAL,
        }]),
        memory_heaps: Cow::Borrowed(&[MemoryHeap { size: GIB }]),
        max_memory_allocation_count: 1,
        max_memory_allocation_size: GIB,
        non_coherent_atom_size: 64,
        buffer_image_granularity: 1024,
        buffer_device_address: false,
        integrated_gpu: false,
    });
    let allocator = GpuAllocator::new(Config::default(), device.props());

    let first = unsafe {
        allocator.allocate_memory(
            &device,
            &reqs(200 * MIB, 64),
            &gpu_only(),
            None,
            SuballocationType::Buffer,
        )
    }
    .unwrap();

    let denied = unsafe {
        allocator.allocate_memory(
            &device,
            &reqs(200 * MIB, 64),
            &gpu_only(),
            None,
            SuballocationType::Buffer,
        )
    };
    assert_eq!(denied.unwrap_err(), AllocationError::TooManyObjects);

    unsafe { allocator.free_memory(&device, first) };
    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn defragmentation_surface_is_stubbed() {
    let device = device();
    let allocator = GpuAllocator::<usize>::new(Config::default(), device.props());

    assert_eq!(allocator.begin_defragmentation(), Err(AllocationError::Unsupported));
    assert_eq!(allocator.end_defragmentation(), Err(AllocationError::Unsupported));
    assert_eq!(
        allocator.begin_defragmentation_pass(),
        Err(AllocationError::Unsupported)
    );
    assert_eq!(
        allocator.end_defragmentation_pass(),
        Err(AllocationError::Unsupported)
    );
    assert_eq!(allocator.check_corruption(!0), Err(AllocationError::Unsupported));

    unsafe { allocator.dispose(&device) }.unwrap();
}

#[test]
fn concurrent_allocate_and_free() {
    let device = device();
    let allocator = GpuAllocator::new(Config::default(), device.props());

    std::thread::scope(|scope| {
        for worker in 0..4 {
            let allocator = &allocator;
            let device = &device;
            scope.spawn(move || {
                let mut live = Vec::new();
                for round in 0..64usize {
                    let size = 4096 << (round % 4);
                    let allocation = unsafe {
                        allocator.allocate_memory(
                            device,
                            &reqs(size, 256),
                            &gpu_only(),
                            None,
                            SuballocationType::Buffer,
                        )
                    }
                    .unwrap();
                    assert_eq!(allocation.offset() % 256, 0);
                    live.push(allocation);

                    if round % 2 == worker % 2 {
                        if let Some(victim) = live.pop() {
                            unsafe { allocator.free_memory(device, victim) };
                        }
                    }
                }
                for allocation in live {
                    unsafe { allocator.free_memory(device, allocation) };
                }
            });
        }
    });

    let stats = allocator.calculate_statistics();
    assert_eq!(stats.allocation_count, 0);
    let budget = allocator.heap_budgets()[0];
    assert_eq!(budget.allocation_bytes, 0);
    assert_eq!(budget.block_bytes, 0);
    assert_eq!(device.live_allocations(), 0);

    unsafe { allocator.dispose(&device) }.unwrap();
}
