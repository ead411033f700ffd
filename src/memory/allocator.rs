use {
    crate::{
        memory::{
            align_up, page_count, AllocationRequirements, AllocationUsage,
            DedicatedResourceHandle, HeapBudget, MemBlock, MemNode,
            MemoryBackend, MemoryProperties, MAX_INDEX, PAGE_SIZE,
        },
        PrettyBitflag, PrettyPages, PrettySize, RenderError,
    },
    ash::vk,
    indoc::indoc,
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

/// How many oversized nodes the sink bucket keeps before returning them to
/// the driver.
const SINK_CAPACITY: usize = 4;

/// Device limits which constrain where blocks may be placed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AllocatorLimits {
    pub non_coherent_atom_size: u64,
    pub buffer_image_granularity: u64,
}

impl Default for AllocatorLimits {
    fn default() -> Self {
        Self {
            non_coherent_atom_size: 1,
            buffer_image_granularity: 1,
        }
    }
}

impl AllocatorLimits {
    pub fn from_properties(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            non_coherent_atom_size: limits.non_coherent_atom_size.max(1),
            buffer_image_granularity: limits.buffer_image_granularity.max(1),
        }
    }
}

/// Recycled nodes for one memory type.
///
/// Bucket `n` (1..=MAX_INDEX) holds nodes which are exactly `n` pages.
/// Bucket 0 is the sink for anything larger.
struct FreeList {
    buckets: Vec<Vec<MemNode>>,
    last_occupied: usize,
}

impl FreeList {
    fn new() -> Self {
        Self {
            buckets: (0..=MAX_INDEX).map(|_| Vec::new()).collect(),
            last_occupied: 0,
        }
    }

    fn take(&mut self, pages: u64) -> Option<MemNode> {
        if pages as usize <= MAX_INDEX {
            let first = pages.max(1) as usize;
            for index in first..=self.last_occupied.max(first).min(MAX_INDEX) {
                if let Some(node) = self.buckets[index].pop() {
                    self.refresh_last_occupied();
                    return Some(node);
                }
            }
        }
        let sink = &mut self.buckets[0];
        let position = sink.iter().position(|node| node.pages() >= pages)?;
        Some(sink.swap_remove(position))
    }

    /// Returns the node back when the sink is full.
    fn insert(&mut self, node: MemNode) -> Option<MemNode> {
        let pages = node.pages() as usize;
        if pages <= MAX_INDEX {
            self.buckets[pages].push(node);
            self.last_occupied = self.last_occupied.max(pages);
            None
        } else if self.buckets[0].len() < SINK_CAPACITY {
            self.buckets[0].push(node);
            None
        } else {
            Some(node)
        }
    }

    fn refresh_last_occupied(&mut self) {
        self.last_occupied = (1..=MAX_INDEX)
            .rev()
            .find(|&index| !self.buckets[index].is_empty())
            .unwrap_or(0);
    }

    fn drain(&mut self) -> impl Iterator<Item = MemNode> + '_ {
        self.last_occupied = 0;
        self.buckets.iter_mut().flat_map(|bucket| bucket.drain(..))
    }

    fn node_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    fn page_total(&self) -> u64 {
        self.buckets.iter().flatten().map(MemNode::pages).sum()
    }
}

/// A point-in-time view of the allocator.
#[derive(Debug, Clone)]
pub struct AllocatorStats {
    /// Live `vkAllocateMemory` allocations made through the allocator.
    pub device_allocations: u64,

    /// Total pages currently owned by the allocator or its pools.
    pub allocated_pages: u64,

    /// (memory type, nodes, pages) for every type with recycled nodes.
    pub free_nodes: Vec<(usize, usize, u64)>,

    pub budgets: Vec<HeapBudget>,
}

impl std::fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            indoc!(
                "
                # Allocator Stats

                device allocations: {}
                allocated: {}

                ## Free Lists

                "
            ),
            self.device_allocations,
            PrettyPages(self.allocated_pages),
        ))?;
        for (memory_type_index, nodes, pages) in &self.free_nodes {
            f.write_fmt(format_args!(
                "[{}] {} nodes, {}\n",
                memory_type_index,
                nodes,
                PrettyPages(*pages)
            ))?;
        }
        if !self.budgets.is_empty() {
            f.write_str("\n## Heap Budgets\n\n")?;
            for (index, budget) in self.budgets.iter().enumerate() {
                f.write_fmt(format_args!(
                    "[{}] usage {} of {}\n",
                    index,
                    PrettySize(budget.usage),
                    PrettySize(budget.budget)
                ))?;
            }
        }
        Ok(())
    }
}

/// The device memory allocator.
///
/// Owns the backend and the free lists of recycled pool nodes. All state is
/// mutex-guarded so pools on different threads can share one allocator.
pub struct Allocator {
    properties: MemoryProperties,
    limits: AllocatorLimits,
    persistent_mapping: bool,
    backend: Mutex<Box<dyn MemoryBackend + Send>>,
    free_lists: Mutex<Vec<FreeList>>,
    budgets: Mutex<Vec<HeapBudget>>,
    device_allocations: AtomicU64,
    allocated_pages: AtomicU64,
}

// Public API
// ----------

impl Allocator {
    /// Create a new allocator.
    ///
    /// # Params
    ///
    /// * `properties` - the memory types and heaps of the physical device
    /// * `limits` - alignment limits reported by the physical device
    /// * `persistent_mapping` - map host-visible nodes as they are created
    /// * `backend` - the source of raw device memory
    pub fn new(
        properties: MemoryProperties,
        limits: AllocatorLimits,
        persistent_mapping: bool,
        backend: impl MemoryBackend + Send + 'static,
    ) -> Self {
        log::trace!("Allocator for device with {}", properties);
        let free_lists =
            properties.types().iter().map(|_| FreeList::new()).collect();
        Self {
            properties,
            limits,
            persistent_mapping,
            backend: Mutex::new(Box::new(backend)),
            free_lists: Mutex::new(free_lists),
            budgets: Mutex::new(Vec::new()),
            device_allocations: AtomicU64::new(0),
            allocated_pages: AtomicU64::new(0),
        }
    }

    pub fn properties(&self) -> &MemoryProperties {
        &self.properties
    }

    pub fn limits(&self) -> AllocatorLimits {
        self.limits
    }

    /// Pick the best memory type for the given usage.
    pub fn find_memory_type(
        &self,
        memory_type_bits: u32,
        usage: AllocationUsage,
    ) -> Result<usize, RenderError> {
        self.properties
            .find_memory_type(memory_type_bits, usage)
            .ok_or(RenderError::NoSupportedTypeForProperties(
                PrettyBitflag(memory_type_bits),
                usage,
            ))
    }

    /// The flush granularity for blocks of this memory type. Zero means the
    /// memory is coherent and never needs flushing.
    pub fn atom_size(&self, memory_type_index: usize) -> u64 {
        if self.properties.is_host_visible(memory_type_index)
            && !self.properties.is_host_coherent(memory_type_index)
        {
            self.limits.non_coherent_atom_size.max(1)
        } else {
            0
        }
    }

    /// Allocate memory for one resource with a node of its own.
    ///
    /// The dedicated-allocation structure is chained only when the driver
    /// prefers or requires it. Host-visible memory is mapped immediately
    /// when persistent mapping is enabled.
    pub fn allocate_dedicated(
        &self,
        usage: AllocationUsage,
        requirements: &AllocationRequirements,
    ) -> Result<MemNode, RenderError> {
        let memory_type_index =
            self.find_memory_type(requirements.memory_type_bits, usage)?;
        let dedicated = if requirements.wants_dedicated() {
            requirements.dedicated_resource_handle
        } else {
            DedicatedResourceHandle::None
        };
        self.allocate_node_from_backend(
            memory_type_index,
            requirements.size_in_bytes,
            dedicated,
            true,
        )
    }

    /// Return a dedicated node to the driver.
    pub fn free_dedicated(&self, node: MemNode) {
        debug_assert!(node.is_dedicated());
        self.free_to_backend(node);
    }

    /// Map a dedicated node which was created without persistent mapping.
    pub fn map_node(
        &self,
        node: &mut MemNode,
    ) -> Result<MemBlock, RenderError> {
        if !self.properties.is_host_visible(node.memory_type_index()) {
            return Err(RenderError::AllocationFailure(format!(
                "memory type {} is not host visible",
                node.memory_type_index()
            )));
        }
        let mut backend = self.backend.lock().unwrap();
        unsafe { node.map(&mut **backend)? };
        Ok(MemBlock::for_node(node, self.atom_size(node.memory_type_index())))
    }

    /// Take a node with at least `min_size_in_bytes` from the free lists, or
    /// allocate a fresh one.
    pub fn allocate_node(
        &self,
        memory_type_index: usize,
        min_size_in_bytes: u64,
    ) -> Result<MemNode, RenderError> {
        let pages = page_count(min_size_in_bytes);
        let recycled = self.free_lists.lock().unwrap()[memory_type_index]
            .take(pages);
        if let Some(node) = recycled {
            log::trace!(
                "Reusing {} of type {} for a request of {}",
                PrettyPages(node.pages()),
                memory_type_index,
                PrettyPages(pages)
            );
            return Ok(node);
        }
        self.allocate_node_from_backend(
            memory_type_index,
            pages * PAGE_SIZE,
            DedicatedResourceHandle::None,
            false,
        )
    }

    /// Return a pool node to the free lists.
    pub fn release_node(&self, mut node: MemNode) {
        if node.is_dedicated() {
            self.free_to_backend(node);
            return;
        }
        node.rewind();
        let memory_type_index = node.memory_type_index();
        let overflow =
            self.free_lists.lock().unwrap()[memory_type_index].insert(node);
        if let Some(node) = overflow {
            log::trace!(
                "Sink bucket for type {} is full, freeing {}",
                memory_type_index,
                PrettyPages(node.pages())
            );
            self.free_to_backend(node);
        }
    }

    /// Return every recycled node of the given memory type to the driver.
    pub fn invalidate_type(&self, memory_type_index: usize) {
        let nodes = self.free_lists.lock().unwrap()[memory_type_index]
            .drain()
            .collect::<Vec<_>>();
        for node in nodes {
            self.free_to_backend(node);
        }
    }

    /// Flush host writes for a block. Coherent memory is skipped.
    pub fn flush(&self, block: &MemBlock) -> Result<(), RenderError> {
        let Some(range) = Self::atom_range(block) else {
            return Ok(());
        };
        unsafe { self.backend.lock().unwrap().flush(&[range]) }
    }

    /// Invalidate host caches for a block. Coherent memory is skipped.
    pub fn invalidate(&self, block: &MemBlock) -> Result<(), RenderError> {
        let Some(range) = Self::atom_range(block) else {
            return Ok(());
        };
        unsafe { self.backend.lock().unwrap().invalidate(&[range]) }
    }

    /// Replace the heap budgets. Budgets are informational and never gate
    /// allocations.
    pub fn update_budget(&self, budgets: Vec<HeapBudget>) {
        *self.budgets.lock().unwrap() = budgets;
    }

    /// Refresh heap budgets from VK_EXT_memory_budget.
    ///
    /// # Safety
    ///
    /// Unsafe because the extension must be enabled on the device.
    pub unsafe fn update(
        &self,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) {
        let mut budget = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();
        let mut properties2 = vk::PhysicalDeviceMemoryProperties2::default()
            .push_next(&mut budget);
        instance.get_physical_device_memory_properties2(
            physical_device,
            &mut properties2,
        );
        let heap_count = properties2.memory_properties.memory_heap_count;
        let budgets = (0..heap_count as usize)
            .map(|index| HeapBudget {
                usage: budget.heap_usage[index],
                budget: budget.heap_budget[index],
            })
            .collect();
        self.update_budget(budgets);
    }

    pub fn budgets(&self) -> Vec<HeapBudget> {
        self.budgets.lock().unwrap().clone()
    }

    pub fn stats(&self) -> AllocatorStats {
        let free_nodes = self
            .free_lists
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, list)| list.node_count() > 0)
            .map(|(index, list)| (index, list.node_count(), list.page_total()))
            .collect();
        AllocatorStats {
            device_allocations: self.device_allocations.load(Ordering::Relaxed),
            allocated_pages: self.allocated_pages.load(Ordering::Relaxed),
            free_nodes,
            budgets: self.budgets(),
        }
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        for memory_type_index in 0..self.properties.types().len() {
            self.invalidate_type(memory_type_index);
        }
        let remaining = self.device_allocations.load(Ordering::Relaxed);
        if remaining > 0 {
            log::warn!(
                "Allocator dropped with {} live device allocations",
                remaining
            );
        }
    }
}

// Private API
// -----------

impl Allocator {
    fn allocate_node_from_backend(
        &self,
        memory_type_index: usize,
        size_in_bytes: u64,
        dedicated: DedicatedResourceHandle,
        is_dedicated: bool,
    ) -> Result<MemNode, RenderError> {
        let mut backend = self.backend.lock().unwrap();
        let memory = unsafe {
            backend.allocate(memory_type_index, size_in_bytes, dedicated)?
        };
        let mut node = MemNode::new(
            memory,
            memory_type_index,
            size_in_bytes,
            is_dedicated,
        );

        if self.persistent_mapping
            && self.properties.is_host_visible(memory_type_index)
        {
            if let Err(err) = unsafe { node.map(&mut **backend) } {
                log::error!(
                    "Unable to map memory of type {}: {}",
                    memory_type_index,
                    err
                );
                unsafe { backend.free(memory, memory_type_index) };
                return Err(RenderError::AllocationFailure(format!(
                    "persistent mapping failed: {}",
                    err
                )));
            }
        }

        self.device_allocations.fetch_add(1, Ordering::Relaxed);
        self.allocated_pages
            .fetch_add(node.pages(), Ordering::Relaxed);
        log::trace!(
            "Allocated {} of type {} (dedicated: {})",
            PrettySize(size_in_bytes),
            memory_type_index,
            is_dedicated
        );
        Ok(node)
    }

    fn free_to_backend(&self, node: MemNode) {
        self.device_allocations.fetch_sub(1, Ordering::Relaxed);
        self.allocated_pages
            .fetch_sub(node.pages(), Ordering::Relaxed);
        unsafe {
            let memory = node.memory();
            self.backend
                .lock()
                .unwrap()
                .free(memory, node.memory_type_index());
        }
    }

    /// The atom-aligned range covering the block, or None for coherent or
    /// unmapped memory.
    fn atom_range(block: &MemBlock) -> Option<vk::MappedMemoryRange<'static>> {
        if !block.needs_flush() {
            return None;
        }
        let atom = block.atom_size();
        let offset = block.offset_in_bytes() / atom * atom;
        let size = align_up(
            block.size_in_bytes() + (block.offset_in_bytes() - offset),
            atom,
        );
        Some(
            vk::MappedMemoryRange::default()
                .memory(unsafe { block.memory() })
                .offset(offset)
                .size(size),
        )
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::memory::{into_shared, FakeBackend},
        pretty_assertions::assert_eq,
    };

    fn properties() -> MemoryProperties {
        MemoryProperties::from_raw(
            &[
                vk::MemoryType {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                vk::MemoryType {
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
                    heap_index: 1,
                },
            ],
            &[
                vk::MemoryHeap {
                    size: 1 << 32,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
                vk::MemoryHeap {
                    size: 1 << 32,
                    flags: vk::MemoryHeapFlags::empty(),
                },
            ],
        )
    }

    #[test]
    fn free_list_walks_upward() {
        let mut list = FreeList::new();
        let memory = vk::DeviceMemory::null();
        assert!(list
            .insert(MemNode::new(memory, 0, 4 * PAGE_SIZE, false))
            .is_none());
        assert_eq!(list.last_occupied, 4);
        assert!(list.take(5).is_none());
        let node = list.take(2).unwrap();
        assert_eq!(node.pages(), 4);
        assert_eq!(list.last_occupied, 0);
    }

    #[test]
    fn oversized_nodes_use_the_sink() {
        let mut list = FreeList::new();
        let memory = vk::DeviceMemory::null();
        let pages = MAX_INDEX as u64 + 4;
        for _ in 0..SINK_CAPACITY {
            assert!(list
                .insert(MemNode::new(memory, 0, pages * PAGE_SIZE, false))
                .is_none());
        }
        let overflow =
            list.insert(MemNode::new(memory, 0, pages * PAGE_SIZE, false));
        assert!(overflow.is_some());
        assert!(list.take(pages + 1).is_none());
        assert_eq!(list.take(MAX_INDEX as u64 + 1).unwrap().pages(), pages);
    }

    #[test]
    fn released_nodes_are_reused() {
        let backend = into_shared(FakeBackend::default());
        let allocator = Allocator::new(
            properties(),
            AllocatorLimits::default(),
            true,
            backend.clone(),
        );

        let node = allocator.allocate_node(0, 100).unwrap();
        assert_eq!(node.pages(), 1);
        allocator.release_node(node);
        let node = allocator.allocate_node(0, PAGE_SIZE).unwrap();
        assert_eq!(backend.lock().unwrap().allocation_count, 1);
        allocator.release_node(node);

        let stats = allocator.stats();
        assert_eq!(stats.device_allocations, 1);
        assert_eq!(stats.free_nodes, vec![(0, 1, 1)]);

        allocator.invalidate_type(0);
        assert_eq!(backend.lock().unwrap().active_allocations, 0);
    }

    #[test]
    fn failed_mapping_frees_memory() {
        let backend = into_shared(FakeBackend {
            fail_mapping: true,
            ..FakeBackend::default()
        });
        let allocator = Allocator::new(
            properties(),
            AllocatorLimits::default(),
            true,
            backend.clone(),
        );
        let result = allocator.allocate_node(1, 64);
        assert!(matches!(result, Err(RenderError::AllocationFailure(_))));
        assert_eq!(backend.lock().unwrap().allocation_count, 1);
        assert_eq!(backend.lock().unwrap().active_allocations, 0);
        assert_eq!(allocator.stats().device_allocations, 0);
    }
}
