use {
    crate::{PrettyBitflag, PrettySize},
    ash::vk,
};

/// A copy of the resource handle associated with an allocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum DedicatedResourceHandle {
    Buffer(vk::Buffer),
    Image(vk::Image),
    #[default]
    None,
}

impl DedicatedResourceHandle {
    /// Get a memory dedicated allocation info struct based on the current
    /// resource. Nulls are used for missing values.
    pub fn as_dedicated_allocation_info(
        &self,
    ) -> vk::MemoryDedicatedAllocateInfo<'static> {
        match self {
            DedicatedResourceHandle::Buffer(buffer) => {
                vk::MemoryDedicatedAllocateInfo::default().buffer(*buffer)
            }
            DedicatedResourceHandle::Image(image) => {
                vk::MemoryDedicatedAllocateInfo::default().image(*image)
            }
            DedicatedResourceHandle::None => {
                vk::MemoryDedicatedAllocateInfo::default()
            }
        }
    }

    pub fn is_some(&self) -> bool {
        !matches!(self, DedicatedResourceHandle::None)
    }
}

/// The tiling class of the last resource placed in a node. Linear and
/// optimal resources which share a `bufferImageGranularity` page must be
/// separated.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum AllocationKind {
    /// Buffers and linear-tiled images.
    Linear,

    /// Optimal-tiled images.
    Optimal,

    /// Nothing has been placed yet.
    #[default]
    Unknown,
}

impl AllocationKind {
    /// True when a resource of kind `next` placed after a resource of this
    /// kind must start on a fresh granularity page.
    pub fn conflicts_with(self, next: AllocationKind) -> bool {
        self != AllocationKind::Unknown
            && next != AllocationKind::Unknown
            && self != next
    }
}

/// All supported memory requirements for a single resource.
///
/// The Memory Requirements 2 and Dedicated Requirements structures are kept
/// together because they're populated at the same time.
#[derive(Copy, Clone, Default)]
pub struct AllocationRequirements {
    pub size_in_bytes: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
    pub prefers_dedicated_allocation: bool,
    pub requires_dedicated_allocation: bool,
    pub dedicated_resource_handle: DedicatedResourceHandle,
    pub kind: AllocationKind,
}

// Public API
// ----------

impl AllocationRequirements {
    /// Get the memory requirements for a given buffer.
    ///
    /// # Params
    ///
    /// * `device` - the device used to create and interact with GPU resources
    /// * `buffer` - the buffer which needs a memory allocation
    pub fn for_buffer(device: &ash::Device, buffer: vk::Buffer) -> Self {
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements2 =
            vk::MemoryRequirements2::default().push_next(&mut dedicated);
        let info = vk::BufferMemoryRequirementsInfo2::default().buffer(buffer);
        unsafe {
            device.get_buffer_memory_requirements2(&info, &mut requirements2);
        }
        let requirements = requirements2.memory_requirements;
        Self::from_raw(
            requirements,
            dedicated.prefers_dedicated_allocation == vk::TRUE,
            dedicated.requires_dedicated_allocation == vk::TRUE,
            DedicatedResourceHandle::Buffer(buffer),
            AllocationKind::Linear,
        )
    }

    /// Get the memory requirements for a given image.
    ///
    /// # Params
    ///
    /// * `device` - the device used to create and interact with GPU resources
    /// * `image` - the image which needs a memory allocation
    /// * `tiling` - the tiling the image was created with
    pub fn for_image(
        device: &ash::Device,
        image: vk::Image,
        tiling: vk::ImageTiling,
    ) -> Self {
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements2 =
            vk::MemoryRequirements2::default().push_next(&mut dedicated);
        let info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        unsafe {
            device.get_image_memory_requirements2(&info, &mut requirements2);
        }
        let requirements = requirements2.memory_requirements;
        let kind = if tiling == vk::ImageTiling::OPTIMAL {
            AllocationKind::Optimal
        } else {
            AllocationKind::Linear
        };
        Self::from_raw(
            requirements,
            dedicated.prefers_dedicated_allocation == vk::TRUE,
            dedicated.requires_dedicated_allocation == vk::TRUE,
            DedicatedResourceHandle::Image(image),
            kind,
        )
    }

    /// Build requirements from plain memory requirements.
    pub fn from_raw(
        requirements: vk::MemoryRequirements,
        prefers_dedicated_allocation: bool,
        requires_dedicated_allocation: bool,
        dedicated_resource_handle: DedicatedResourceHandle,
        kind: AllocationKind,
    ) -> Self {
        Self {
            size_in_bytes: requirements.size,
            alignment: requirements.alignment.max(1),
            memory_type_bits: requirements.memory_type_bits,
            prefers_dedicated_allocation,
            requires_dedicated_allocation,
            dedicated_resource_handle,
            kind,
        }
    }

    /// True when the driver asked for a dedicated allocation.
    pub fn wants_dedicated(&self) -> bool {
        self.prefers_dedicated_allocation || self.requires_dedicated_allocation
    }
}

impl std::fmt::Debug for AllocationRequirements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationRequirements")
            .field("size_in_bytes", &PrettySize(self.size_in_bytes))
            .field("alignment", &self.alignment)
            .field("memory_type_bits", &PrettyBitflag(self.memory_type_bits))
            .field(
                "prefers_dedicated_allocation",
                &self.prefers_dedicated_allocation,
            )
            .field(
                "requires_dedicated_allocation",
                &self.requires_dedicated_allocation,
            )
            .field("kind", &self.kind)
            .finish()
    }
}

impl std::fmt::Display for AllocationRequirements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#?}", self))
    }
}
