use {
    crate::{
        memory::{DedicatedResourceHandle, MemoryProperties},
        PrettySize, RenderError,
    },
    anyhow::Context,
    ash::vk::{self, Handle},
    indoc::indoc,
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    },
};

/// The source of raw device memory for the [crate::memory::Allocator].
///
/// Everything above this trait deals in pages and blocks; implementations
/// only ever see whole `vkAllocateMemory` sized requests.
pub trait MemoryBackend {
    /// Allocate a region of device memory.
    ///
    /// # Safety
    ///
    /// Unsafe because memory must be freed before the device is destroyed.
    unsafe fn allocate(
        &mut self,
        memory_type_index: usize,
        size_in_bytes: u64,
        dedicated: DedicatedResourceHandle,
    ) -> Result<vk::DeviceMemory, RenderError>;

    /// Return device memory to the driver. Mapped memory is implicitly
    /// unmapped.
    ///
    /// # Safety
    ///
    /// Unsafe because the application is responsible for synchronizing
    /// access to device memory. It is an error to free memory while ongoing
    /// GPU operations are still referencing it.
    unsafe fn free(
        &mut self,
        memory: vk::DeviceMemory,
        memory_type_index: usize,
    );

    /// Map the entire memory object into host address space.
    ///
    /// # Safety
    ///
    /// Unsafe because the memory must be host visible and not mapped yet.
    unsafe fn map(
        &mut self,
        memory: vk::DeviceMemory,
    ) -> Result<*mut u8, RenderError>;

    /// Flush host writes to non-coherent memory.
    ///
    /// # Safety
    ///
    /// Unsafe because every range must lie within mapped memory.
    unsafe fn flush(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError>;

    /// Make device writes to non-coherent memory visible to the host.
    ///
    /// # Safety
    ///
    /// Unsafe because every range must lie within mapped memory.
    unsafe fn invalidate(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError>;
}

pub type SharedBackend<T> = Arc<Mutex<T>>;

/// Move a memory backend into an Arc Mutex so it can be inspected while an
/// allocator owns a clone.
pub fn into_shared<T: MemoryBackend>(backend: T) -> SharedBackend<T> {
    Arc::new(Mutex::new(backend))
}

impl<T: MemoryBackend + ?Sized> MemoryBackend for Box<T> {
    unsafe fn allocate(
        &mut self,
        memory_type_index: usize,
        size_in_bytes: u64,
        dedicated: DedicatedResourceHandle,
    ) -> Result<vk::DeviceMemory, RenderError> {
        self.as_mut()
            .allocate(memory_type_index, size_in_bytes, dedicated)
    }

    unsafe fn free(
        &mut self,
        memory: vk::DeviceMemory,
        memory_type_index: usize,
    ) {
        self.as_mut().free(memory, memory_type_index)
    }

    unsafe fn map(
        &mut self,
        memory: vk::DeviceMemory,
    ) -> Result<*mut u8, RenderError> {
        self.as_mut().map(memory)
    }

    unsafe fn flush(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError> {
        self.as_mut().flush(ranges)
    }

    unsafe fn invalidate(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError> {
        self.as_mut().invalidate(ranges)
    }
}

impl<T: MemoryBackend> MemoryBackend for Arc<Mutex<T>> {
    unsafe fn allocate(
        &mut self,
        memory_type_index: usize,
        size_in_bytes: u64,
        dedicated: DedicatedResourceHandle,
    ) -> Result<vk::DeviceMemory, RenderError> {
        self.lock()
            .unwrap()
            .allocate(memory_type_index, size_in_bytes, dedicated)
    }

    unsafe fn free(
        &mut self,
        memory: vk::DeviceMemory,
        memory_type_index: usize,
    ) {
        self.lock().unwrap().free(memory, memory_type_index)
    }

    unsafe fn map(
        &mut self,
        memory: vk::DeviceMemory,
    ) -> Result<*mut u8, RenderError> {
        self.lock().unwrap().map(memory)
    }

    unsafe fn flush(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError> {
        self.lock().unwrap().flush(ranges)
    }

    unsafe fn invalidate(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError> {
        self.lock().unwrap().invalidate(ranges)
    }
}

/// A memory backend which always allocates memory directly from the device.
pub struct DeviceBackend {
    device: ash::Device,
}

impl DeviceBackend {
    /// Create a new device backend.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///  - the device must not be destroyed while this backend still exists
    ///  - all memory allocated by this backend must be freed before
    ///    destroying the device
    pub unsafe fn new(device: ash::Device) -> Self {
        Self { device }
    }
}

impl MemoryBackend for DeviceBackend {
    unsafe fn allocate(
        &mut self,
        memory_type_index: usize,
        size_in_bytes: u64,
        dedicated: DedicatedResourceHandle,
    ) -> Result<vk::DeviceMemory, RenderError> {
        let mut dedicated_info = dedicated.as_dedicated_allocation_info();
        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size_in_bytes)
            .memory_type_index(memory_type_index as u32);
        if dedicated.is_some() {
            allocate_info = allocate_info.push_next(&mut dedicated_info);
        }
        self.device
            .allocate_memory(&allocate_info, None)
            .map_err(|err| {
                log::warn!(
                    "vkAllocateMemory failed for {} of type {}: {:?}",
                    PrettySize(size_in_bytes),
                    memory_type_index,
                    err
                );
                RenderError::AllocationFailure(format!(
                    "vkAllocateMemory returned {:?}",
                    err
                ))
            })
    }

    unsafe fn free(
        &mut self,
        memory: vk::DeviceMemory,
        _memory_type_index: usize,
    ) {
        self.device.free_memory(memory, None)
    }

    unsafe fn map(
        &mut self,
        memory: vk::DeviceMemory,
    ) -> Result<*mut u8, RenderError> {
        let ptr = self
            .device
            .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            .with_context(|| "Unable to map a memory allocation!")?;
        Ok(ptr as *mut u8)
    }

    unsafe fn flush(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError> {
        self.device
            .flush_mapped_memory_ranges(ranges)
            .with_context(|| "Unable to flush mapped memory ranges")?;
        Ok(())
    }

    unsafe fn invalidate(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError> {
        self.device
            .invalidate_mapped_memory_ranges(ranges)
            .with_context(|| "Unable to invalidate mapped memory ranges")?;
        Ok(())
    }
}

/// A fake memory backend which keeps track of every request and backs mapped
/// memory with host allocations.
#[derive(Default)]
pub struct FakeBackend {
    /// An ordered collection of (memory type, size) for every allocation.
    pub allocations: Vec<(usize, u64)>,

    /// The number of allocations which have yet to be freed.
    pub active_allocations: u32,

    /// The total number of allocations made with this backend.
    pub allocation_count: u64,

    /// The number of ranges passed to flush.
    pub flushed_ranges: u64,

    /// The number of ranges passed to invalidate.
    pub invalidated_ranges: u64,

    /// When set every allocation request fails.
    pub fail_allocations: bool,

    /// When set every map request fails.
    pub fail_mapping: bool,

    pub(crate) sizes: HashMap<u64, u64>,
    pub(crate) mapped: HashMap<u64, Vec<u64>>,
}

impl MemoryBackend for FakeBackend {
    unsafe fn allocate(
        &mut self,
        memory_type_index: usize,
        size_in_bytes: u64,
        _dedicated: DedicatedResourceHandle,
    ) -> Result<vk::DeviceMemory, RenderError> {
        if self.fail_allocations {
            return Err(RenderError::AllocationFailure(
                "fake allocation failure".to_owned(),
            ));
        }
        self.active_allocations += 1;
        self.allocation_count += 1;
        self.allocations.push((memory_type_index, size_in_bytes));
        self.sizes.insert(self.allocation_count, size_in_bytes);
        Ok(vk::DeviceMemory::from_raw(self.allocation_count))
    }

    unsafe fn free(
        &mut self,
        memory: vk::DeviceMemory,
        _memory_type_index: usize,
    ) {
        self.active_allocations -= 1;
        self.sizes.remove(&memory.as_raw());
        self.mapped.remove(&memory.as_raw());
    }

    unsafe fn map(
        &mut self,
        memory: vk::DeviceMemory,
    ) -> Result<*mut u8, RenderError> {
        if self.fail_mapping {
            return Err(RenderError::RuntimeError(anyhow::anyhow!(
                "fake mapping failure"
            )));
        }
        let size = *self
            .sizes
            .get(&memory.as_raw())
            .context("Mapping memory which was never allocated")?;
        // u64 storage keeps the host pointer aligned for any vertex type.
        let storage = self
            .mapped
            .entry(memory.as_raw())
            .or_insert_with(|| vec![0; size.div_ceil(8) as usize]);
        Ok(storage.as_mut_ptr() as *mut u8)
    }

    unsafe fn flush(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError> {
        self.flushed_ranges += ranges.len() as u64;
        Ok(())
    }

    unsafe fn invalidate(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError> {
        self.invalidated_ranges += ranges.len() as u64;
        Ok(())
    }
}

#[derive(Default)]
struct Metrics {
    total_allocations: u32,
    leaked_allocations: u32,
    total_bytes: u64,
}

/// A backend decorator which tracks metrics and logs a report for all
/// allocations made through the wrapped backend when dropped.
pub struct TraceBackend<T: MemoryBackend> {
    wrapped_backend: T,
    name: String,
    total: Metrics,
    per_type: HashMap<usize, Metrics>,
    properties: MemoryProperties,
}

impl<T: MemoryBackend> TraceBackend<T> {
    pub fn new(
        properties: MemoryProperties,
        wrapped_backend: T,
        name: impl Into<String>,
    ) -> Self {
        Self {
            wrapped_backend,
            name: name.into(),
            total: Metrics::default(),
            per_type: HashMap::new(),
            properties,
        }
    }

    /// Render the current allocation report.
    pub fn report(&self) -> String {
        let mut report = format!(
            indoc!(
                "
                # {} Allocation Trace

                ## Total Allocations

                total allocations: {}
                leaked allocations: {}
                total bytes: {}

                ## Allocations Per Memory Type

                "
            ),
            self.name,
            self.total.total_allocations,
            self.total.leaked_allocations,
            PrettySize(self.total.total_bytes),
        );

        let mut types = self.per_type.keys().copied().collect::<Vec<_>>();
        types.sort_unstable();
        for memory_type_index in types {
            let metrics = &self.per_type[&memory_type_index];
            report.push_str(&format!(
                indoc!(
                    "
                    ### Memory Type {}
                    Properties: {:?}

                    total allocations: {}
                    leaked allocations: {}

                    "
                ),
                memory_type_index,
                self.properties.types()[memory_type_index].property_flags,
                metrics.total_allocations,
                metrics.leaked_allocations,
            ));
        }
        report
    }
}

impl<T: MemoryBackend> Drop for TraceBackend<T> {
    fn drop(&mut self) {
        log::debug!("{}", self.report());
    }
}

impl<T: MemoryBackend> MemoryBackend for TraceBackend<T> {
    unsafe fn allocate(
        &mut self,
        memory_type_index: usize,
        size_in_bytes: u64,
        dedicated: DedicatedResourceHandle,
    ) -> Result<vk::DeviceMemory, RenderError> {
        let memory = self.wrapped_backend.allocate(
            memory_type_index,
            size_in_bytes,
            dedicated,
        )?;
        for metrics in [
            &mut self.total,
            self.per_type.entry(memory_type_index).or_default(),
        ] {
            metrics.total_allocations += 1;
            metrics.leaked_allocations += 1;
            metrics.total_bytes += size_in_bytes;
        }
        Ok(memory)
    }

    unsafe fn free(
        &mut self,
        memory: vk::DeviceMemory,
        memory_type_index: usize,
    ) {
        self.total.leaked_allocations -= 1;
        self.per_type
            .entry(memory_type_index)
            .or_default()
            .leaked_allocations -= 1;
        self.wrapped_backend.free(memory, memory_type_index)
    }

    unsafe fn map(
        &mut self,
        memory: vk::DeviceMemory,
    ) -> Result<*mut u8, RenderError> {
        self.wrapped_backend.map(memory)
    }

    unsafe fn flush(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError> {
        self.wrapped_backend.flush(ranges)
    }

    unsafe fn invalidate(
        &mut self,
        ranges: &[vk::MappedMemoryRange],
    ) -> Result<(), RenderError> {
        self.wrapped_backend.invalidate(ranges)
    }
}
