mod logging;

use {
    ash::vk::{self, Handle},
    ccthw_render_core::{
        device::FakeFenceDevice,
        frame::{Loop, LoopInfo, WorkerPool},
        memory::{
            into_shared, Allocator, AllocatorLimits, FakeBackend,
            MemoryProperties, SharedBackend,
        },
        queue::{QueueFamilyInfo, QueueOperations, QueuePool},
        render_pass::{DescriptorSink, WriteBatch},
    },
    std::{
        sync::{Arc, Mutex},
        thread::ThreadId,
        time::Duration,
    },
};

pub use self::logging::setup_logger;

/// A discrete GPU: device-local memory, a host-visible coherent type and a
/// cached non-coherent readback type.
pub fn discrete_properties() -> MemoryProperties {
    MemoryProperties::from_raw(
        &[
            vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
            vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            },
            vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                heap_index: 1,
            },
        ],
        &[
            vk::MemoryHeap {
                size: 8 << 30,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            },
            vk::MemoryHeap {
                size: 16 << 30,
                flags: vk::MemoryHeapFlags::empty(),
            },
        ],
    )
}

/// An allocator over fake device memory.
pub fn fake_allocator(
    properties: MemoryProperties,
    limits: AllocatorLimits,
) -> (Arc<Allocator>, SharedBackend<FakeBackend>) {
    let backend = into_shared(FakeBackend::default());
    let allocator = Allocator::new(properties, limits, true, backend.clone());
    (Arc::new(allocator), backend)
}

/// Records descriptor writes and the thread each batch was written on.
#[derive(Default)]
pub struct RecordingSink {
    pub writes: Mutex<Vec<(ThreadId, WriteBatch)>>,
}

impl DescriptorSink for RecordingSink {
    unsafe fn write_batches(&self, batches: &[WriteBatch]) {
        let thread = std::thread::current().id();
        self.writes
            .lock()
            .unwrap()
            .extend(batches.iter().cloned().map(|batch| (thread, batch)));
    }
}

/// A loop over fake fences with one graphics queue.
pub fn fake_loop(
    fences: Arc<FakeFenceDevice>,
    descriptor_sink: Arc<dyn DescriptorSink>,
    frame_emitter_barrier: bool,
) -> Loop {
    let queues = QueuePool::new(vec![QueueFamilyInfo {
        index: 0,
        ops: QueueOperations::GRAPHICS
            | QueueOperations::COMPUTE
            | QueueOperations::TRANSFER,
        queues: vec![vk::Queue::from_raw(1)],
    }]);
    Loop::new(LoopInfo {
        fence_device: fences,
        queues: Arc::new(queues),
        workers: Arc::new(WorkerPool::new(2, "test-worker").unwrap()),
        descriptor_sink,
        allocator: None,
        device: None,
        update_interval: Duration::from_millis(1),
        frame_emitter_barrier,
    })
}

/// A tiny deterministic generator for interleaving tests.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    /// A value in `0..bound`.
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}
