use {
    crate::{
        device::DeviceObject,
        memory::{MemBlock, MemNode},
    },
    ash::vk,
    std::ffi::CString,
};

/// A queue-family ownership transfer which must be replayed before the
/// resource is used by another family.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OwnershipTransfer {
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

impl OwnershipTransfer {
    pub fn buffer_barrier(
        &self,
        buffer: vk::Buffer,
    ) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }

    pub fn image_barrier(
        &self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
    ) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
            .image(image)
            .subresource_range(range)
    }
}

/// A harvested barrier, ready to be recorded.
#[derive(Debug, Copy, Clone)]
pub enum PendingBarrier {
    Buffer(vk::BufferMemoryBarrier<'static>),
    Image(vk::ImageMemoryBarrier<'static>),
}

// The barrier structs carry no p_next chain.
unsafe impl Send for PendingBarrier {}
unsafe impl Sync for PendingBarrier {}

/// Where a resource's memory came from.
#[derive(Debug)]
pub enum ResourceMemory {
    /// Suballocated from a pool which owns the node.
    Pool(MemBlock),

    /// A node of its own, freed with the resource.
    Dedicated(MemNode),
}

impl ResourceMemory {
    pub fn block(&self) -> MemBlock {
        match self {
            ResourceMemory::Pool(block) => *block,
            ResourceMemory::Dedicated(node) => MemBlock::for_node(node, 0),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct BufferInfo {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
}

/// A buffer and the memory bound to it.
#[derive(Debug)]
pub struct Buffer {
    raw: vk::Buffer,
    info: BufferInfo,
    memory: ResourceMemory,
    pending_transfer: Option<OwnershipTransfer>,
}

impl Buffer {
    pub(crate) fn new(
        raw: vk::Buffer,
        info: BufferInfo,
        memory: ResourceMemory,
    ) -> Self {
        Self {
            raw,
            info,
            memory,
            pending_transfer: None,
        }
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn info(&self) -> &BufferInfo {
        &self.info
    }

    pub fn memory(&self) -> &ResourceMemory {
        &self.memory
    }

    pub fn set_pending_transfer(&mut self, transfer: OwnershipTransfer) {
        self.pending_transfer = Some(transfer);
    }

    /// Take the pending ownership transfer, if any, as a barrier.
    pub fn take_pending_barrier(&mut self) -> Option<PendingBarrier> {
        let transfer = self.pending_transfer.take()?;
        Some(PendingBarrier::Buffer(transfer.buffer_barrier(self.raw)))
    }

    /// The device objects to destroy once the buffer is retired.
    pub fn into_objects(self) -> Vec<DeviceObject> {
        let mut objects = vec![DeviceObject::Buffer(self.raw)];
        if let ResourceMemory::Dedicated(node) = self.memory {
            objects.push(DeviceObject::Memory(node));
        }
        objects
    }
}

#[derive(Debug, Copy, Clone)]
pub struct ImageInfo {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
}

impl Default for ImageInfo {
    fn default() -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED,
            flags: vk::ImageCreateFlags::empty(),
        }
    }
}

impl ImageInfo {
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        match self.format {
            vk::Format::D16_UNORM | vk::Format::D32_SFLOAT => {
                vk::ImageAspectFlags::DEPTH
            }
            vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
            _ => vk::ImageAspectFlags::COLOR,
        }
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }
}

/// An image. Swapchain images have no memory of their own.
#[derive(Debug)]
pub struct Image {
    raw: vk::Image,
    info: ImageInfo,
    memory: Option<ResourceMemory>,
    pending_transfer: Option<OwnershipTransfer>,
}

impl Image {
    pub(crate) fn new(
        raw: vk::Image,
        info: ImageInfo,
        memory: Option<ResourceMemory>,
    ) -> Self {
        Self {
            raw,
            info,
            memory,
            pending_transfer: None,
        }
    }

    /// Wrap an image owned by the swapchain.
    pub fn for_swapchain(raw: vk::Image, info: ImageInfo) -> Self {
        Self::new(raw, info, None)
    }

    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn memory(&self) -> Option<&ResourceMemory> {
        self.memory.as_ref()
    }

    pub fn is_swapchain_image(&self) -> bool {
        self.memory.is_none()
    }

    pub fn set_pending_transfer(&mut self, transfer: OwnershipTransfer) {
        self.pending_transfer = Some(transfer);
    }

    pub fn take_pending_barrier(&mut self) -> Option<PendingBarrier> {
        let transfer = self.pending_transfer.take()?;
        Some(PendingBarrier::Image(
            transfer.image_barrier(self.raw, self.info.full_range()),
        ))
    }

    pub fn into_objects(self) -> Vec<DeviceObject> {
        match self.memory {
            None => vec![],
            Some(ResourceMemory::Pool(_)) => {
                vec![DeviceObject::Image(self.raw)]
            }
            Some(ResourceMemory::Dedicated(node)) => vec![
                DeviceObject::Image(self.raw),
                DeviceObject::Memory(node),
            ],
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct ImageViewInfo {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub range: vk::ImageSubresourceRange,
}

impl ImageViewInfo {
    pub fn for_image(info: &ImageInfo) -> Self {
        let view_type = if info.array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        Self {
            view_type,
            format: info.format,
            range: info.full_range(),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct ImageView {
    pub raw: vk::ImageView,
    pub image: vk::Image,
    pub info: ImageViewInfo,
    /// The frame cache index of this view.
    pub cache_index: Option<u64>,
}

#[derive(Debug, Copy, Clone)]
pub struct Sampler {
    pub raw: vk::Sampler,
    pub info: SamplerInfo,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SamplerInfo {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerInfo {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_anisotropy: None,
        }
    }
}

/// A shader entry point. Compute entry points carry their local size.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EntryPoint {
    pub name: String,
    pub local_size: Option<[u32; 3]>,
}

/// A push constant block declared by a shader.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PushConstantBlock {
    pub offset: u32,
    pub size: u32,
}

/// Precompiled SPIR-V plus the metadata extracted alongside it.
#[derive(Debug, Clone)]
pub struct ShaderInfo {
    pub stage: vk::ShaderStageFlags,
    pub words: Vec<u32>,
    pub entry_points: Vec<EntryPoint>,
    pub push_constants: Vec<PushConstantBlock>,
    /// (constant id, size in bytes)
    pub specialization_constants: Vec<(u32, u32)>,
}

impl ShaderInfo {
    pub fn entry_point(&self, name: &str) -> Option<&EntryPoint> {
        self.entry_points.iter().find(|entry| entry.name == name)
    }

    pub fn push_constant_ranges(&self) -> Vec<vk::PushConstantRange> {
        self.push_constants
            .iter()
            .map(|block| vk::PushConstantRange {
                stage_flags: self.stage,
                offset: block.offset,
                size: block.size,
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct ShaderModule {
    pub raw: vk::ShaderModule,
    pub info: ShaderInfo,
}

impl ShaderModule {
    /// The name of the first entry point as a C string.
    pub fn entry_name(&self) -> CString {
        let name = self
            .info
            .entry_points
            .first()
            .map_or("main", |entry| entry.name.as_str());
        CString::new(name).unwrap_or_else(|_| c"main".to_owned())
    }
}

#[derive(Debug, Clone)]
pub struct Framebuffer {
    pub raw: vk::Framebuffer,
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
    pub cache_index: Option<u64>,
}

#[cfg(test)]
mod test {
    use {super::*, ash::vk::Handle, pretty_assertions::assert_eq};

    #[test]
    fn depth_formats_use_depth_aspect() {
        let info = ImageInfo {
            format: vk::Format::D24_UNORM_S8_UINT,
            ..ImageInfo::default()
        };
        assert_eq!(
            info.aspect(),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            ImageInfo::default().aspect(),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn pending_transfer_is_taken_once() {
        let mut image = Image::for_swapchain(
            vk::Image::from_raw(7),
            ImageInfo::default(),
        );
        image.set_pending_transfer(OwnershipTransfer {
            src_queue_family: 1,
            dst_queue_family: 0,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        });
        let Some(PendingBarrier::Image(barrier)) = image.take_pending_barrier()
        else {
            panic!("expected an image barrier");
        };
        assert_eq!(barrier.src_queue_family_index, 1);
        assert_eq!(barrier.image, vk::Image::from_raw(7));
        assert!(image.take_pending_barrier().is_none());
        assert!(image.into_objects().is_empty());
    }
}
