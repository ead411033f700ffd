use {
    crate::{
        memory::{
            AllocationRequirements, AllocationUsage, Allocator, MemBlock,
            MemNode,
        },
        PrettySize, RenderError,
    },
    std::{collections::HashMap, sync::Arc},
};

/// A bag of memory nodes, keyed by memory type, which bump-allocates blocks
/// for a single frame or subsystem.
///
/// Blocks are never freed individually. [DeviceMemoryPool::reset] returns
/// every node to the allocator free lists at once.
pub struct DeviceMemoryPool {
    allocator: Arc<Allocator>,
    nodes: HashMap<usize, Vec<MemNode>>,
    allocated_bytes: u64,
}

// Public API
// ----------

impl DeviceMemoryPool {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self {
            allocator,
            nodes: HashMap::new(),
            allocated_bytes: 0,
        }
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// Allocate a block for a resource with the given requirements.
    ///
    /// # Params
    ///
    /// * `usage` - how the memory will be used, drives memory type selection
    /// * `requirements` - size, alignment and kind of the resource
    pub fn allocate(
        &mut self,
        usage: AllocationUsage,
        requirements: &AllocationRequirements,
    ) -> Result<MemBlock, RenderError> {
        let memory_type_index = self
            .allocator
            .find_memory_type(requirements.memory_type_bits, usage)?;
        self.allocate_in_type(memory_type_index, requirements)
    }

    /// Allocate a block from a specific memory type.
    pub fn allocate_in_type(
        &mut self,
        memory_type_index: usize,
        requirements: &AllocationRequirements,
    ) -> Result<MemBlock, RenderError> {
        let atom_size = self.allocator.atom_size(memory_type_index);
        let granularity = self.allocator.limits().buffer_image_granularity;
        let nodes = self.nodes.entry(memory_type_index).or_default();

        for node in nodes.iter_mut().rev() {
            if let Some(block) = node.suballocate(
                requirements.size_in_bytes,
                requirements.alignment,
                atom_size,
                granularity,
                requirements.kind,
            ) {
                self.allocated_bytes += block.size_in_bytes();
                return Ok(block);
            }
        }

        let mut node = self
            .allocator
            .allocate_node(memory_type_index, requirements.size_in_bytes)?;
        let block = node.suballocate(
            requirements.size_in_bytes,
            requirements.alignment,
            atom_size,
            granularity,
            requirements.kind,
        );
        let Some(block) = block else {
            let size = node.size_in_bytes();
            self.allocator.release_node(node);
            return Err(RenderError::AllocationFailure(format!(
                "{} does not fit in a fresh node of {}",
                PrettySize(requirements.size_in_bytes),
                PrettySize(size)
            )));
        };
        nodes.push(node);
        self.allocated_bytes += block.size_in_bytes();
        Ok(block)
    }

    /// Return every node to the allocator. All blocks handed out by this
    /// pool become invalid.
    pub fn reset(&mut self) {
        if self.allocated_bytes > 0 {
            log::trace!(
                "Resetting pool with {} in {} nodes",
                PrettySize(self.allocated_bytes),
                self.node_count()
            );
        }
        for (_, nodes) in self.nodes.drain() {
            for node in nodes {
                self.allocator.release_node(node);
            }
        }
        self.allocated_bytes = 0;
    }

    pub fn node_count(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }

    /// Bytes handed out since the last reset, not counting alignment.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }
}

impl Drop for DeviceMemoryPool {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::memory::{
            into_shared, AllocationKind, AllocatorLimits,
            DedicatedResourceHandle, FakeBackend, MemoryProperties,
            SharedBackend, PAGE_SIZE,
        },
        ash::vk,
        pretty_assertions::assert_eq,
    };

    fn requirements(size: u64, alignment: u64) -> AllocationRequirements {
        AllocationRequirements::from_raw(
            vk::MemoryRequirements {
                size,
                alignment,
                memory_type_bits: 0b1,
            },
            false,
            false,
            DedicatedResourceHandle::None,
            AllocationKind::Linear,
        )
    }

    fn allocator(
        backend: FakeBackend,
    ) -> (Arc<Allocator>, SharedBackend<FakeBackend>) {
        let backend = into_shared(backend);
        let properties = MemoryProperties::from_raw(
            &[vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            }],
            &[vk::MemoryHeap {
                size: 1 << 32,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            }],
        );
        let allocator = Allocator::new(
            properties,
            AllocatorLimits::default(),
            true,
            backend.clone(),
        );
        (Arc::new(allocator), backend)
    }

    #[test]
    fn blocks_share_a_node() {
        let (allocator, backend) = allocator(FakeBackend::default());
        let mut pool = DeviceMemoryPool::new(allocator);
        let a = pool
            .allocate(AllocationUsage::DeviceLocal, &requirements(64, 64))
            .unwrap();
        let b = pool
            .allocate(AllocationUsage::DeviceLocal, &requirements(64, 256))
            .unwrap();
        assert_eq!(a.offset_in_bytes(), 0);
        assert_eq!(b.offset_in_bytes(), 256);
        assert_eq!(pool.node_count(), 1);
        assert_eq!(backend.lock().unwrap().allocation_count, 1);
    }

    #[test]
    fn a_miss_allocates_a_new_node() {
        let (allocator, backend) = allocator(FakeBackend::default());
        let mut pool = DeviceMemoryPool::new(allocator);
        let usage = AllocationUsage::DeviceLocal;
        pool.allocate(usage, &requirements(PAGE_SIZE - 16, 1)).unwrap();
        let block = pool
            .allocate(AllocationUsage::DeviceLocal, &requirements(64, 1))
            .unwrap();
        assert_eq!(block.offset_in_bytes(), 0);
        assert_eq!(pool.node_count(), 2);

        let large = pool
            .allocate(usage, &requirements(3 * PAGE_SIZE, 1))
            .unwrap();
        assert_eq!(large.offset_in_bytes(), 0);
        assert_eq!(
            backend.lock().unwrap().allocations,
            vec![(0, PAGE_SIZE), (0, PAGE_SIZE), (0, 3 * PAGE_SIZE)]
        );
    }

    #[test]
    fn reset_returns_nodes_to_the_allocator() {
        let (allocator, backend) = allocator(FakeBackend::default());
        let mut pool = DeviceMemoryPool::new(allocator.clone());
        for _ in 0..3 {
            pool.allocate(AllocationUsage::DeviceLocal, &requirements(1024, 16))
                .unwrap();
            pool.reset();
        }
        assert_eq!(backend.lock().unwrap().allocation_count, 1);
        assert_eq!(allocator.stats().free_nodes, vec![(0, 1, 1)]);
    }

    #[test]
    fn unsupported_memory_type_bits() {
        let (allocator, _backend) = allocator(FakeBackend::default());
        let mut pool = DeviceMemoryPool::new(allocator);
        let mut req = requirements(64, 1);
        req.memory_type_bits = 0b10;
        let result = pool.allocate(AllocationUsage::DeviceLocal, &req);
        assert!(matches!(
            result,
            Err(RenderError::NoSupportedTypeForProperties(_, _))
        ));
    }
}
