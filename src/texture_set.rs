//! The bindless texture set.
//!
//! One descriptor set holds every sampler, sampled image and storage buffer
//! used by the material system. Each set remembers what was last written to
//! every slot so an update only writes the slots which changed.

use {
    crate::{
        device::{
            Buffer, DeviceFeatures, DeviceObject, Image, ImageView,
            PendingBarrier,
        },
        RenderError,
    },
    ash::vk,
};

pub const SAMPLER_BINDING: u32 = 0;
pub const IMAGE_BINDING: u32 = 1;
pub const BUFFER_BINDING: u32 = 2;

/// Upper bound on the image array regardless of device limits.
pub const MAX_TEXTURE_SET_IMAGES: u32 = 1024;

/// Upper bound on the storage buffer array regardless of device limits.
pub const MAX_TEXTURE_SET_BUFFERS: u32 = 1024;

/// The shape of a texture set layout.
#[derive(Debug, Clone)]
pub struct TextureSetLayoutInfo {
    pub samplers: Vec<vk::Sampler>,
    pub image_count: u32,
    pub buffer_count: u32,
    pub partially_bound: bool,
    pub update_after_bind: bool,
}

impl TextureSetLayoutInfo {
    /// Size the arrays from the device limits, capped at the compile-time
    /// maximums.
    pub fn for_device(
        limits: &vk::PhysicalDeviceLimits,
        features: DeviceFeatures,
        samplers: Vec<vk::Sampler>,
    ) -> Self {
        Self {
            samplers,
            image_count: limits
                .max_per_stage_descriptor_sampled_images
                .min(MAX_TEXTURE_SET_IMAGES),
            buffer_count: limits
                .max_per_stage_descriptor_storage_buffers
                .min(MAX_TEXTURE_SET_BUFFERS),
            partially_bound: features.descriptor_binding_partially_bound,
            update_after_bind: features.update_after_bind,
        }
    }

    fn binding_flags(&self) -> vk::DescriptorBindingFlags {
        let mut flags = vk::DescriptorBindingFlags::empty();
        if self.partially_bound {
            flags |= vk::DescriptorBindingFlags::PARTIALLY_BOUND;
        }
        if self.update_after_bind {
            flags |= vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
        }
        flags
    }
}

/// The descriptor set layout, the pool sets come from, and the objects
/// written into slots which have nothing bound.
pub struct TextureSetLayout {
    info: TextureSetLayoutInfo,
    raw: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    empty_view: vk::ImageView,
    empty_buffer: vk::Buffer,
}

// Public API
// ----------

impl TextureSetLayout {
    /// Create the layout and a pool with room for `max_sets` sets.
    ///
    /// # Safety
    ///
    /// Unsafe because the layout must be destroyed before the device, and the
    /// empty view and buffer must outlive every set.
    pub unsafe fn new(
        device: &ash::Device,
        info: TextureSetLayoutInfo,
        max_sets: u32,
        empty_view: vk::ImageView,
        empty_buffer: vk::Buffer,
    ) -> Result<Self, RenderError> {
        let stages = vk::ShaderStageFlags::VERTEX
            | vk::ShaderStageFlags::FRAGMENT
            | vk::ShaderStageFlags::COMPUTE;
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .stage_flags(stages)
                .immutable_samplers(&info.samplers),
            vk::DescriptorSetLayoutBinding::default()
                .binding(IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(info.image_count)
                .stage_flags(stages),
            vk::DescriptorSetLayoutBinding::default()
                .binding(BUFFER_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(info.buffer_count)
                .stage_flags(stages),
        ];
        let array_flags = info.binding_flags();
        let binding_flags =
            [vk::DescriptorBindingFlags::empty(), array_flags, array_flags];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
                .binding_flags(&binding_flags);
        let mut create_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        if info.update_after_bind {
            create_info = create_info.flags(
                vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL,
            );
        }
        if !array_flags.is_empty() {
            create_info = create_info.push_next(&mut flags_info);
        }
        let raw = device.create_descriptor_set_layout(&create_info, None)?;

        let mut pool_sizes = vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: info.image_count * max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: info.buffer_count * max_sets,
            },
        ];
        if !info.samplers.is_empty() {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: info.samplers.len() as u32 * max_sets,
            });
        }
        let mut pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);
        if info.update_after_bind {
            pool_info = pool_info
                .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND);
        }
        let pool = match device.create_descriptor_pool(&pool_info, None) {
            Ok(pool) => pool,
            Err(err) => {
                device.destroy_descriptor_set_layout(raw, None);
                return Err(err.into());
            }
        };

        log::trace!(
            "Texture set layout with {} images, {} buffers, {} samplers",
            info.image_count,
            info.buffer_count,
            info.samplers.len()
        );

        Ok(Self {
            info,
            raw,
            pool,
            empty_view,
            empty_buffer,
        })
    }

    pub fn info(&self) -> &TextureSetLayoutInfo {
        &self.info
    }

    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw
    }

    /// Allocate a set from the layout's pool.
    ///
    /// # Safety
    ///
    /// Unsafe because the set must not be used after the layout is retired.
    pub unsafe fn allocate_set(
        &self,
        device: &ash::Device,
    ) -> Result<TextureSet, RenderError> {
        let layouts = [self.raw];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let raw = device.allocate_descriptor_sets(&allocate_info)?[0];
        Ok(TextureSet::new(raw, &self.info))
    }

    /// Write the planned descriptors.
    ///
    /// # Safety
    ///
    /// Unsafe because the set must not be in use by the GPU unless the layout
    /// was created with update-after-bind.
    pub unsafe fn apply(
        &self,
        device: &ash::Device,
        set: vk::DescriptorSet,
        writes: &[DescriptorWrite],
    ) {
        if writes.is_empty() {
            return;
        }
        let image_infos = writes
            .iter()
            .map(|write| match &write.items {
                DescriptorItems::Images(views) => views
                    .iter()
                    .map(|view| vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view.unwrap_or(self.empty_view),
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    })
                    .collect(),
                DescriptorItems::Buffers(_) => vec![],
            })
            .collect::<Vec<Vec<_>>>();
        let buffer_infos = writes
            .iter()
            .map(|write| match &write.items {
                DescriptorItems::Buffers(buffers) => buffers
                    .iter()
                    .map(|buffer| vk::DescriptorBufferInfo {
                        buffer: buffer.unwrap_or(self.empty_buffer),
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    })
                    .collect(),
                DescriptorItems::Images(_) => vec![],
            })
            .collect::<Vec<Vec<_>>>();

        let vk_writes = writes
            .iter()
            .enumerate()
            .map(|(index, write)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.first_element);
                match write.items {
                    DescriptorItems::Images(_) => base
                        .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                        .image_info(&image_infos[index]),
                    DescriptorItems::Buffers(_) => base
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(&buffer_infos[index]),
                }
            })
            .collect::<Vec<_>>();
        device.update_descriptor_sets(&vk_writes, &[]);
    }

    /// The objects to destroy once the layout is retired.
    pub fn into_objects(self) -> Vec<DeviceObject> {
        vec![
            DeviceObject::DescriptorPool(self.pool),
            DeviceObject::DescriptorSetLayout(self.raw),
        ]
    }
}

/// What a slot currently holds on the GPU.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlotState<T> {
    /// Never written. Only possible with partially bound descriptors.
    Unwritten,

    /// Holds the layout's empty object.
    Empty,

    Bound(T),
}

/// A contiguous run of descriptors. `None` entries receive the empty object.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DescriptorItems {
    Images(Vec<Option<vk::ImageView>>),
    Buffers(Vec<Option<vk::Buffer>>),
}

impl DescriptorItems {
    pub fn len(&self) -> usize {
        match self {
            DescriptorItems::Images(items) => items.len(),
            DescriptorItems::Buffers(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One planned `VkWriteDescriptorSet`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub first_element: u32,
    pub items: DescriptorItems,
}

/// A bindless descriptor set plus what was last written to each slot.
#[derive(Debug)]
pub struct TextureSet {
    raw: vk::DescriptorSet,
    partially_bound: bool,
    images: Vec<Option<vk::ImageView>>,
    buffers: Vec<Option<vk::Buffer>>,
    written_images: Vec<SlotState<vk::ImageView>>,
    written_buffers: Vec<SlotState<vk::Buffer>>,
    pending_barriers: Vec<PendingBarrier>,
}

impl TextureSet {
    pub fn new(raw: vk::DescriptorSet, info: &TextureSetLayoutInfo) -> Self {
        Self {
            raw,
            partially_bound: info.partially_bound,
            images: vec![None; info.image_count as usize],
            buffers: vec![None; info.buffer_count as usize],
            written_images: vec![
                SlotState::Unwritten;
                info.image_count as usize
            ],
            written_buffers: vec![
                SlotState::Unwritten;
                info.buffer_count as usize
            ],
            pending_barriers: Vec::new(),
        }
    }

    pub fn raw(&self) -> vk::DescriptorSet {
        self.raw
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Request `view` in image slot `slot`. Out of range slots are ignored.
    pub fn set_image(&mut self, slot: usize, view: vk::ImageView) {
        match self.images.get_mut(slot) {
            Some(entry) => *entry = Some(view),
            None => log::warn!("Image slot {} is out of range", slot),
        }
    }

    pub fn clear_image(&mut self, slot: usize) {
        if let Some(entry) = self.images.get_mut(slot) {
            *entry = None;
        }
    }

    /// Request `buffer` in buffer slot `slot`. Out of range slots are
    /// ignored.
    pub fn set_buffer(&mut self, slot: usize, buffer: vk::Buffer) {
        match self.buffers.get_mut(slot) {
            Some(entry) => *entry = Some(buffer),
            None => log::warn!("Buffer slot {} is out of range", slot),
        }
    }

    pub fn clear_buffer(&mut self, slot: usize) {
        if let Some(entry) = self.buffers.get_mut(slot) {
            *entry = None;
        }
    }

    /// Bind an image view and harvest the image's pending ownership
    /// transfer.
    pub fn bind_image(
        &mut self,
        slot: usize,
        view: &ImageView,
        image: &mut Image,
    ) {
        self.set_image(slot, view.raw);
        self.pending_barriers.extend(image.take_pending_barrier());
    }

    /// Bind a buffer and harvest its pending ownership transfer.
    pub fn bind_buffer(&mut self, slot: usize, buffer: &mut Buffer) {
        self.set_buffer(slot, buffer.raw());
        self.pending_barriers.extend(buffer.take_pending_barrier());
    }

    /// Barriers to record before the set is next used.
    pub fn take_barriers(&mut self) -> Vec<PendingBarrier> {
        std::mem::take(&mut self.pending_barriers)
    }

    /// Compute the writes which bring the GPU state up to date and record
    /// them as written.
    pub fn plan_writes(&mut self) -> Vec<DescriptorWrite> {
        let mut writes = Vec::new();
        for (first, run) in plan_runs(
            &self.images,
            &mut self.written_images,
            self.partially_bound,
        ) {
            writes.push(DescriptorWrite {
                binding: IMAGE_BINDING,
                first_element: first,
                items: DescriptorItems::Images(run),
            });
        }
        for (first, run) in plan_runs(
            &self.buffers,
            &mut self.written_buffers,
            self.partially_bound,
        ) {
            writes.push(DescriptorWrite {
                binding: BUFFER_BINDING,
                first_element: first,
                items: DescriptorItems::Buffers(run),
            });
        }
        writes
    }

    pub fn written_images(&self) -> &[SlotState<vk::ImageView>] {
        &self.written_images
    }

    pub fn written_buffers(&self) -> &[SlotState<vk::Buffer>] {
        &self.written_buffers
    }
}

// Private API
// -----------

fn target_state<T: Copy + Eq>(
    requested: Option<T>,
    current: SlotState<T>,
    partially_bound: bool,
) -> SlotState<T> {
    match requested {
        Some(object) => SlotState::Bound(object),
        None if partially_bound && current == SlotState::Unwritten => {
            SlotState::Unwritten
        }
        None => SlotState::Empty,
    }
}

/// Batch every changed slot into contiguous runs.
fn plan_runs<T: Copy + Eq>(
    requested: &[Option<T>],
    written: &mut [SlotState<T>],
    partially_bound: bool,
) -> Vec<(u32, Vec<Option<T>>)> {
    let mut runs = Vec::new();
    let mut current: Option<(u32, Vec<Option<T>>)> = None;
    for (slot, (wanted, state)) in
        requested.iter().zip(written.iter_mut()).enumerate()
    {
        let target = target_state(*wanted, *state, partially_bound);
        if target == *state {
            runs.extend(current.take());
            continue;
        }
        *state = target;
        match &mut current {
            Some((_, run)) => run.push(*wanted),
            None => current = Some((slot as u32, vec![*wanted])),
        }
    }
    runs.extend(current);
    runs
}
