use {
    crate::{pretty_wrappers::PrettyBitflag, PrettySize},
    ash::vk,
    indoc::indoc,
};

/// How an allocation will be used. Each usage scores the available memory
/// types differently, see [MemoryProperties::score].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AllocationUsage {
    /// Memory only touched by the GPU.
    DeviceLocal,

    /// GPU memory which the host writes directly (persistent mapped buffers).
    DeviceLocalHostVisible,

    /// Host memory used as the source of an upload.
    HostTransitionSource,

    /// Host memory used as the destination of a readback.
    HostTransitionDestination,

    /// Transient attachments which may never be backed by real memory.
    DeviceLocalLazilyAllocated,
}

/// The coarse role of a memory heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeapClass {
    HostLocal,
    DeviceLocal,
    DeviceLocalHostVisible,
}

/// Heap usage as reported by VK_EXT_memory_budget.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapBudget {
    pub usage: vk::DeviceSize,
    pub budget: vk::DeviceSize,
}

#[derive(Debug, Clone)]
pub struct MemoryProperties {
    types: Vec<vk::MemoryType>,
    heaps: Vec<vk::MemoryHeap>,
    heap_classes: Vec<HeapClass>,
}

// Public API
// ----------

impl MemoryProperties {
    /// Get the memory properties for the given physical device.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        let properties = unsafe {
            instance.get_physical_device_memory_properties(physical_device)
        };
        Self::from_raw(
            &properties.memory_types[0..properties.memory_type_count as usize],
            &properties.memory_heaps[0..properties.memory_heap_count as usize],
        )
    }

    /// Build the memory properties from explicit type and heap tables.
    ///
    /// This is how tests describe imaginary devices.
    pub fn from_raw(
        types: &[vk::MemoryType],
        heaps: &[vk::MemoryHeap],
    ) -> Self {
        let heap_classes = heaps
            .iter()
            .enumerate()
            .map(|(heap_index, heap)| {
                if !heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                    return HeapClass::HostLocal;
                }
                let host_visible = types.iter().any(|memory_type| {
                    memory_type.heap_index as usize == heap_index
                        && memory_type
                            .property_flags
                            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
                });
                if host_visible {
                    HeapClass::DeviceLocalHostVisible
                } else {
                    HeapClass::DeviceLocal
                }
            })
            .collect();
        Self {
            types: types.to_vec(),
            heaps: heaps.to_vec(),
            heap_classes,
        }
    }

    /// All of the currently usable memory heaps on this system.
    pub fn heaps(&self) -> &[vk::MemoryHeap] {
        &self.heaps
    }

    /// All of the currently usable memory types on this system.
    pub fn types(&self) -> &[vk::MemoryType] {
        &self.types
    }

    /// The class of the heap which owns the given memory type.
    pub fn heap_class(&self, memory_type_index: usize) -> HeapClass {
        let heap_index = self.types[memory_type_index].heap_index as usize;
        self.heap_classes[heap_index]
    }

    pub fn is_host_visible(&self, memory_type_index: usize) -> bool {
        self.types[memory_type_index]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_host_coherent(&self, memory_type_index: usize) -> bool {
        self.types[memory_type_index]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Score a memory type for the given usage. Zero means the type must not
    /// be used.
    pub fn score(
        &self,
        usage: AllocationUsage,
        memory_type_index: usize,
    ) -> i32 {
        use ash::vk::MemoryPropertyFlags as F;

        let flags = self.types[memory_type_index].property_flags;
        if flags.contains(F::PROTECTED) {
            return 0;
        }

        let heap_class = self.heap_class(memory_type_index);
        let has = |flag: F| flags.contains(flag);

        let score = match usage {
            AllocationUsage::DeviceLocal => {
                if !has(F::DEVICE_LOCAL) {
                    return 0;
                }
                let mut score = match heap_class {
                    HeapClass::DeviceLocal => 24,
                    HeapClass::DeviceLocalHostVisible => 16,
                    HeapClass::HostLocal => 4,
                };
                if !has(F::HOST_VISIBLE) {
                    score += 8;
                }
                if has(F::LAZILY_ALLOCATED) {
                    score -= 12;
                }
                score
            }
            AllocationUsage::DeviceLocalHostVisible => {
                if !has(F::DEVICE_LOCAL) || !has(F::HOST_VISIBLE) {
                    return 0;
                }
                let mut score = 16;
                if has(F::HOST_COHERENT) {
                    score += 4;
                }
                if has(F::HOST_CACHED) {
                    score += 1;
                }
                score
            }
            AllocationUsage::HostTransitionSource => {
                if !has(F::HOST_VISIBLE) {
                    return 0;
                }
                let mut score = 10;
                if has(F::HOST_COHERENT) {
                    score += 8;
                }
                if heap_class == HeapClass::HostLocal {
                    score += 4;
                }
                if has(F::HOST_CACHED) {
                    score -= 2;
                }
                score
            }
            AllocationUsage::HostTransitionDestination => {
                if !has(F::HOST_VISIBLE) {
                    return 0;
                }
                let mut score = 10;
                if has(F::HOST_CACHED) {
                    score += 8;
                }
                if has(F::HOST_COHERENT) {
                    score -= 4;
                }
                if heap_class == HeapClass::HostLocal {
                    score += 2;
                }
                score
            }
            AllocationUsage::DeviceLocalLazilyAllocated => {
                if !has(F::DEVICE_LOCAL) {
                    return 0;
                }
                let mut score = 10;
                if has(F::LAZILY_ALLOCATED) {
                    score += 12;
                }
                if has(F::HOST_VISIBLE) {
                    score -= 2;
                }
                score
            }
        };
        score.max(0)
    }

    /// Pick the highest scoring memory type allowed by `memory_type_bits`.
    ///
    /// Ties go to the lowest type index, matching the driver's own ordering
    /// preference.
    pub fn find_memory_type(
        &self,
        memory_type_bits: u32,
        usage: AllocationUsage,
    ) -> Option<usize> {
        let mut best: Option<(usize, i32)> = None;
        for index in 0..self.types.len() {
            if memory_type_bits & (1 << index) == 0 {
                continue;
            }
            let score = self.score(usage, index);
            if score <= 0 {
                continue;
            }
            match best {
                Some((_, best_score)) if best_score >= score => {}
                _ => best = Some((index, score)),
            }
        }
        best.map(|(index, _)| index)
    }
}

impl std::fmt::Display for MemoryProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("# Memory Properties\n\n")?;
        f.write_str("## Memory Types\n\n")?;

        for (index, memory_type) in self.types.iter().enumerate() {
            f.write_fmt(format_args!(
                indoc!(
                    "
                        [{}] property_flags: {:#?}
                                heap_index: {}
                                heap_class: {:?}

                        "
                ),
                index,
                memory_type.property_flags,
                memory_type.heap_index,
                self.heap_class(index),
            ))?;
        }

        f.write_str("\n## Memory Heaps\n\n")?;

        for (index, heap) in self.heaps.iter().enumerate() {
            f.write_fmt(format_args!(
                indoc!(
                    "
                        [{}] flags: {:#?}
                             size: {}
                             types: {}

                        "
                ),
                index,
                heap.flags,
                PrettySize(heap.size),
                PrettyBitflag(self.type_mask_for_heap(index)),
            ))?;
        }

        Ok(())
    }
}

// Private API
// -----------

impl MemoryProperties {
    fn type_mask_for_heap(&self, heap_index: usize) -> u32 {
        self.types
            .iter()
            .enumerate()
            .filter(|(_, memory_type)| {
                memory_type.heap_index as usize == heap_index
            })
            .fold(0, |mask, (index, _)| mask | (1 << index))
    }
}
