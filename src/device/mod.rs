//! Owners of Vulkan device objects.
//!
//! Objects are thin wrappers around their handles. Destruction is deferred:
//! retired objects are queued against the frame which last used them and
//! destroyed once that frame completes.

mod command;
mod deferred;
mod frame_cache;
mod objects;
mod pipeline;
mod sync;

use {
    crate::{
        memory::{
            AllocationRequirements, AllocationUsage, Allocator,
            DeviceMemoryPool,
        },
        RenderError,
    },
    anyhow::Context,
    ash::vk,
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

pub use self::{
    command::{CommandBuffer, CommandPool},
    deferred::{DeferredQueue, DeviceObject},
    frame_cache::{CacheKey, CachedObject, FrameCache},
    objects::{
        Buffer, BufferInfo, EntryPoint, Framebuffer, Image, ImageInfo,
        ImageView, ImageViewInfo, OwnershipTransfer, PendingBarrier,
        PushConstantBlock, ResourceMemory, Sampler, SamplerInfo, ShaderInfo,
        ShaderModule,
    },
    pipeline::{
        BlendInfo, ComputePipeline, GraphicPipeline, GraphicPipelineInfo,
        PipelineKey,
    },
    sync::{
        FakeFenceDevice, Fence, FenceDevice, FenceState, Semaphore,
        SemaphorePool,
    },
};

/// Optional device capabilities discovered at device creation.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct DeviceFeatures {
    pub memory_budget: bool,
    pub descriptor_indexing: bool,
    pub descriptor_binding_partially_bound: bool,
    pub update_after_bind: bool,
}

/// A logical device plus the state every object wrapper needs.
pub struct Device {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    raw: ash::Device,
    properties: vk::PhysicalDeviceProperties,
    features: DeviceFeatures,
    allocator: Arc<Allocator>,
    deferred: Mutex<DeferredQueue>,
    frame_cache: Mutex<FrameCache>,
    latest_frame_order: AtomicU64,
}

// Public API
// ----------

impl Device {
    /// Wrap a logical device.
    ///
    /// # Safety
    ///
    /// Unsafe because the device must outlive every object created through
    /// it, and the instance must outlive the device.
    pub unsafe fn new(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        raw: ash::Device,
        features: DeviceFeatures,
        allocator: Arc<Allocator>,
        frame_cache_capacity: usize,
    ) -> Self {
        let properties =
            instance.get_physical_device_properties(physical_device);
        Self {
            instance,
            physical_device,
            raw,
            properties,
            features,
            allocator,
            deferred: Mutex::new(DeferredQueue::default()),
            frame_cache: Mutex::new(FrameCache::new(frame_cache_capacity)),
            latest_frame_order: AtomicU64::new(0),
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub fn features(&self) -> DeviceFeatures {
        self.features
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// Refresh heap budgets when VK_EXT_memory_budget is enabled.
    pub fn update_budget(&self) {
        if self.features.memory_budget {
            unsafe {
                self.allocator.update(&self.instance, self.physical_device)
            };
        }
    }

    /// Create a buffer and bind memory to it.
    ///
    /// With a pool the buffer is suballocated and lives as long as the pool's
    /// current generation. Without one it gets memory of its own.
    pub fn create_buffer(
        &self,
        info: BufferInfo,
        usage: AllocationUsage,
        pool: Option<&mut DeviceMemoryPool>,
    ) -> Result<Buffer, RenderError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { self.raw.create_buffer(&create_info, None)? };
        let requirements = AllocationRequirements::for_buffer(&self.raw, raw);

        let memory = match self.bind_memory(usage, &requirements, pool) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.raw.destroy_buffer(raw, None) };
                return Err(err);
            }
        };
        let block = memory.block();
        let bound = unsafe {
            self.raw.bind_buffer_memory(
                raw,
                block.memory(),
                block.offset_in_bytes(),
            )
        };
        let buffer = Buffer::new(raw, info, memory);
        if let Err(err) = bound {
            self.destroy_now(buffer.into_objects());
            return Err(err.into());
        }
        Ok(buffer)
    }

    /// Create an image and bind memory to it.
    pub fn create_image(
        &self,
        info: ImageInfo,
        usage: AllocationUsage,
        pool: Option<&mut DeviceMemoryPool>,
    ) -> Result<Image, RenderError> {
        let create_info = vk::ImageCreateInfo::default()
            .flags(info.flags)
            .image_type(info.image_type)
            .format(info.format)
            .extent(info.extent)
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(info.samples)
            .tiling(info.tiling)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { self.raw.create_image(&create_info, None)? };
        let requirements =
            AllocationRequirements::for_image(&self.raw, raw, info.tiling);

        let memory = match self.bind_memory(usage, &requirements, pool) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.raw.destroy_image(raw, None) };
                return Err(err);
            }
        };
        let block = memory.block();
        let bound = unsafe {
            self.raw
                .bind_image_memory(raw, block.memory(), block.offset_in_bytes())
        };
        let image = Image::new(raw, info, Some(memory));
        if let Err(err) = bound {
            self.destroy_now(image.into_objects());
            return Err(err.into());
        }
        Ok(image)
    }

    /// Get or create a view of `image`. Views are owned by the frame cache.
    pub fn image_view(
        &self,
        image: vk::Image,
        info: ImageViewInfo,
    ) -> Result<ImageView, RenderError> {
        let key = CacheKey::ImageView {
            image,
            view_type: info.view_type,
            format: info.format,
            aspect: info.range.aspect_mask,
            base_mip_level: info.range.base_mip_level,
            level_count: info.range.level_count,
            base_array_layer: info.range.base_array_layer,
            layer_count: info.range.layer_count,
        };
        let mut cache = self.frame_cache.lock().unwrap();
        if let Some(CachedObject::ImageView(raw)) = cache.get(&key) {
            return Ok(ImageView {
                raw,
                image,
                info,
                cache_index: None,
            });
        }
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(info.view_type)
            .format(info.format)
            .subresource_range(info.range);
        let raw = unsafe { self.raw.create_image_view(&create_info, None)? };
        let (index, evicted) = cache.add(key, CachedObject::ImageView(raw));
        drop(cache);
        self.retire_cached(evicted);
        Ok(ImageView {
            raw,
            image,
            info,
            cache_index: Some(index),
        })
    }

    /// Get or create a framebuffer. Framebuffers are owned by the frame
    /// cache.
    pub fn framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Framebuffer, RenderError> {
        let key = CacheKey::Framebuffer {
            render_pass,
            attachments: attachments.to_vec(),
            extent: (extent.width, extent.height),
            layers: 1,
        };
        let mut cache = self.frame_cache.lock().unwrap();
        let (raw, cache_index) = match cache.get(&key) {
            Some(CachedObject::Framebuffer(raw)) => (raw, None),
            _ => {
                let create_info = vk::FramebufferCreateInfo::default()
                    .render_pass(render_pass)
                    .attachments(attachments)
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);
                let raw =
                    unsafe { self.raw.create_framebuffer(&create_info, None)? };
                let (index, evicted) =
                    cache.add(key, CachedObject::Framebuffer(raw));
                drop(cache);
                self.retire_cached(evicted);
                (raw, Some(index))
            }
        };
        Ok(Framebuffer {
            raw,
            render_pass,
            attachments: attachments.to_vec(),
            extent,
            cache_index,
        })
    }

    /// Drop every cached view of `image`, and the framebuffers using them.
    pub fn forget_image(&self, image: vk::Image) {
        let removed = self.frame_cache.lock().unwrap().remove_image(image);
        self.retire_cached(removed);
    }

    pub fn create_sampler(
        &self,
        info: SamplerInfo,
    ) -> Result<Sampler, RenderError> {
        let mut create_info = vk::SamplerCreateInfo::default()
            .mag_filter(info.mag_filter)
            .min_filter(info.min_filter)
            .mipmap_mode(info.mipmap_mode)
            .address_mode_u(info.address_mode)
            .address_mode_v(info.address_mode)
            .address_mode_w(info.address_mode)
            .max_lod(vk::LOD_CLAMP_NONE);
        if let Some(anisotropy) = info.max_anisotropy {
            create_info = create_info
                .anisotropy_enable(true)
                .max_anisotropy(anisotropy);
        }
        let raw = unsafe { self.raw.create_sampler(&create_info, None)? };
        Ok(Sampler { raw, info })
    }

    pub fn create_shader_module(
        &self,
        info: ShaderInfo,
    ) -> Result<ShaderModule, RenderError> {
        let create_info =
            vk::ShaderModuleCreateInfo::default().code(&info.words);
        let raw = unsafe {
            self.raw
                .create_shader_module(&create_info, None)
                .with_context(|| {
                    format!("Unable to create {:?} shader module", info.stage)
                })?
        };
        Ok(ShaderModule { raw, info })
    }

    pub fn create_semaphore(&self) -> Result<vk::Semaphore, RenderError> {
        let raw = unsafe {
            self.raw
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        };
        Ok(raw)
    }

    /// Queue objects for destruction after the frame with `frame_order`
    /// completes.
    pub fn retire(&self, frame_order: u64, objects: Vec<DeviceObject>) {
        let mut deferred = self.deferred.lock().unwrap();
        for object in objects {
            deferred.retire(frame_order, object);
        }
    }

    /// Record the order of the newest frame handed to the device.
    pub fn set_latest_frame_order(&self, frame_order: u64) {
        self.latest_frame_order
            .fetch_max(frame_order, Ordering::SeqCst);
    }

    pub fn latest_frame_order(&self) -> u64 {
        self.latest_frame_order.load(Ordering::SeqCst)
    }

    /// Queue objects which any frame in flight may still reference.
    pub fn retire_in_flight(&self, objects: Vec<DeviceObject>) {
        if objects.is_empty() {
            return;
        }
        self.retire(self.latest_frame_order(), objects);
    }

    /// Destroy everything retired at or before `completed_order`.
    pub fn collect_garbage(&self, completed_order: u64) -> usize {
        let mut objects = Vec::new();
        self.deferred
            .lock()
            .unwrap()
            .collect(completed_order, |object| objects.push(object));
        let count = objects.len();
        self.destroy_now(objects);
        count
    }

    /// Destroy objects immediately.
    pub fn destroy_now(&self, objects: Vec<DeviceObject>) {
        for object in objects {
            unsafe { self.destroy_object(object) };
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.raw.device_wait_idle() {
                log::error!("Unable to wait for the device to idle: {}", err);
            }
        }
        let mut objects = Vec::new();
        self.deferred
            .lock()
            .unwrap()
            .drain(|object| objects.push(object));
        let cached = self.frame_cache.lock().unwrap().clear();
        for object in cached {
            objects.push(match object {
                CachedObject::ImageView(view) => DeviceObject::ImageView(view),
                CachedObject::Framebuffer(framebuffer) => {
                    DeviceObject::Framebuffer(framebuffer)
                }
            });
        }
        self.destroy_now(objects);
    }
}

// Private API
// -----------

impl Device {
    fn bind_memory(
        &self,
        usage: AllocationUsage,
        requirements: &AllocationRequirements,
        pool: Option<&mut DeviceMemoryPool>,
    ) -> Result<ResourceMemory, RenderError> {
        match pool {
            Some(pool) if !requirements.requires_dedicated_allocation => {
                Ok(ResourceMemory::Pool(pool.allocate(usage, requirements)?))
            }
            _ => Ok(ResourceMemory::Dedicated(
                self.allocator.allocate_dedicated(usage, requirements)?,
            )),
        }
    }

    fn retire_cached(&self, objects: Vec<CachedObject>) {
        let objects = objects
            .into_iter()
            .map(|object| match object {
                CachedObject::ImageView(view) => DeviceObject::ImageView(view),
                CachedObject::Framebuffer(framebuffer) => {
                    DeviceObject::Framebuffer(framebuffer)
                }
            })
            .collect();
        self.retire_in_flight(objects);
    }

    unsafe fn destroy_object(&self, object: DeviceObject) {
        let device = &self.raw;
        match object {
            DeviceObject::Buffer(raw) => device.destroy_buffer(raw, None),
            DeviceObject::Image(raw) => device.destroy_image(raw, None),
            DeviceObject::ImageView(raw) => {
                device.destroy_image_view(raw, None)
            }
            DeviceObject::Sampler(raw) => device.destroy_sampler(raw, None),
            DeviceObject::Framebuffer(raw) => {
                device.destroy_framebuffer(raw, None)
            }
            DeviceObject::RenderPass(raw) => {
                device.destroy_render_pass(raw, None)
            }
            DeviceObject::Pipeline(raw) => device.destroy_pipeline(raw, None),
            DeviceObject::PipelineLayout(raw) => {
                device.destroy_pipeline_layout(raw, None)
            }
            DeviceObject::DescriptorSetLayout(raw) => {
                device.destroy_descriptor_set_layout(raw, None)
            }
            DeviceObject::DescriptorPool(raw) => {
                device.destroy_descriptor_pool(raw, None)
            }
            DeviceObject::ShaderModule(raw) => {
                device.destroy_shader_module(raw, None)
            }
            DeviceObject::Semaphore(raw) => device.destroy_semaphore(raw, None),
            DeviceObject::CommandPool(raw) => {
                device.destroy_command_pool(raw, None)
            }
            DeviceObject::Swapchain(raw) => {
                let loader =
                    ash::khr::swapchain::Device::new(&self.instance, &self.raw);
                loader.destroy_swapchain(raw, None);
            }
            DeviceObject::Memory(node) => self.allocator.free_dedicated(node),
        }
    }
}
