//! Pool allocations over fake device memory.

use {
    anyhow::Result,
    assert2::check,
    ash::vk,
    ccthw_render_core::memory::{
        AllocationKind, AllocationRequirements, AllocationUsage,
        AllocatorLimits, DedicatedResourceHandle, DeviceMemoryPool,
        MappedRegion, MemoryProperties, PAGE_SIZE,
    },
    regex::Regex,
    scopeguard::defer,
    std::collections::HashMap,
};

mod common;

fn requirements(
    size: u64,
    alignment: u64,
    kind: AllocationKind,
) -> AllocationRequirements {
    AllocationRequirements::from_raw(
        vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits: 0b111,
        },
        false,
        false,
        DedicatedResourceHandle::None,
        kind,
    )
}

#[test]
pub fn reset_pools_reuse_their_nodes() -> Result<()> {
    common::setup_logger();
    let (allocator, backend) = common::fake_allocator(
        common::discrete_properties(),
        AllocatorLimits::default(),
    );

    let usages = [
        AllocationUsage::DeviceLocal,
        AllocationUsage::HostTransitionSource,
        AllocationUsage::HostTransitionDestination,
    ];
    let mut pool = DeviceMemoryPool::new(allocator.clone());
    let mut first_round = 0;
    for round in 0..3 {
        for usage in usages {
            for _ in 0..10_000 {
                pool.allocate(
                    usage,
                    &requirements(4096, 256, AllocationKind::Linear),
                )?;
            }
        }
        pool.reset();

        let allocations = backend.lock().unwrap().allocation_count;
        if round == 0 {
            first_round = allocations;
        }
        check!(allocations == first_round);
    }

    // 10k blocks of 4 KiB fill five single-page nodes per memory type
    check!(first_round == 15);
    check!(
        allocator.stats().free_nodes == vec![(0, 5, 5), (1, 5, 5), (2, 5, 5)]
    );
    check!(backend.lock().unwrap().active_allocations == 15);

    let report = allocator.stats().to_string();
    log::info!("{}", report);
    let free_list = Regex::new(r"\[(\d)\] 5 nodes")?;
    check!(free_list.captures_iter(&report).count() == 3);
    Ok(())
}

#[test]
pub fn blocks_respect_alignment_atoms_and_granularity() -> Result<()> {
    common::setup_logger();
    let limits = AllocatorLimits {
        non_coherent_atom_size: 256,
        buffer_image_granularity: 1024,
    };
    let (allocator, _backend) =
        common::fake_allocator(common::discrete_properties(), limits);
    let mut pool = DeviceMemoryPool::new(allocator.clone());
    defer! { log::debug!("{}", allocator.stats()); }

    let usages = [
        AllocationUsage::DeviceLocal,
        AllocationUsage::HostTransitionSource,
        AllocationUsage::HostTransitionDestination,
    ];
    let kinds = [AllocationKind::Linear, AllocationKind::Optimal];
    let mut rng = common::Lcg::new(7);
    let mut last_kind = HashMap::new();

    for _ in 0..2_000 {
        let usage = usages[rng.below(3) as usize];
        let kind = kinds[rng.below(2) as usize];
        let alignment = 1 << rng.below(9);
        let size = 1 + rng.below(64 * 1024);
        let block = pool.allocate(usage, &requirements(size, alignment, kind))?;

        let memory_type = block.memory_type_index();
        let offset = block.offset_in_bytes();
        check!(offset % alignment == 0);
        if memory_type == 2 {
            // cached readback memory is not coherent
            check!(block.needs_flush());
            check!(offset % limits.non_coherent_atom_size == 0);
        } else {
            check!(!block.needs_flush());
        }

        // each node tracks the kind of its latest block
        let node = unsafe { block.memory() };
        let previous =
            last_kind.insert(node, kind).unwrap_or(AllocationKind::Unknown);
        if previous.conflicts_with(kind) {
            check!(offset % limits.buffer_image_granularity == 0);
        }
    }
    Ok(())
}

#[test]
pub fn coherent_lazily_allocated_memory_skips_flushes() -> Result<()> {
    common::setup_logger();
    let properties = MemoryProperties::from_raw(
        &[
            vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
            vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::LAZILY_ALLOCATED
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 0,
            },
        ],
        &[vk::MemoryHeap {
            size: 4 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        }],
    );
    check!(
        properties.score(AllocationUsage::DeviceLocalLazilyAllocated, 1) > 0
    );

    let (allocator, backend) =
        common::fake_allocator(properties, AllocatorLimits::default());
    let mut pool = DeviceMemoryPool::new(allocator.clone());
    let block = pool.allocate(
        AllocationUsage::DeviceLocalLazilyAllocated,
        &requirements(1024, 16, AllocationKind::Optimal),
    )?;
    check!(block.memory_type_index() == 1);
    check!(block.is_mapped());

    {
        let mut region =
            unsafe { MappedRegion::<u32>::new(&allocator, block)? };
        region.fill(0xff);
        allocator.invalidate(&block)?;
    }
    let backend = backend.lock().unwrap();
    check!(backend.flushed_ranges == 0);
    check!(backend.invalidated_ranges == 0);
    Ok(())
}

#[test]
pub fn oversized_requests_get_their_own_pages() -> Result<()> {
    common::setup_logger();
    let (allocator, backend) = common::fake_allocator(
        common::discrete_properties(),
        AllocatorLimits::default(),
    );
    let mut pool = DeviceMemoryPool::new(allocator.clone());
    let block = pool.allocate(
        AllocationUsage::DeviceLocal,
        &requirements(3 * PAGE_SIZE + 1, 256, AllocationKind::Linear),
    )?;
    check!(block.offset_in_bytes() == 0);
    pool.reset();

    // the four page node is recycled for a smaller multi-page request
    pool.allocate(
        AllocationUsage::DeviceLocal,
        &requirements(2 * PAGE_SIZE, 256, AllocationKind::Linear),
    )?;
    check!(backend.lock().unwrap().allocations == vec![(0, 4 * PAGE_SIZE)]);
    Ok(())
}
