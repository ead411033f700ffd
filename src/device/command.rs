use {
    crate::{device::PendingBarrier, RenderError},
    ash::vk,
};

/// A transient command pool for one queue family.
pub struct CommandPool {
    raw: vk::CommandPool,
    family_index: u32,
    buffers: Vec<vk::CommandBuffer>,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    ///
    /// Unsafe because the pool must be destroyed before the device.
    pub unsafe fn new(
        device: &ash::Device,
        family_index: u32,
    ) -> Result<Self, RenderError> {
        let raw = Self::create_raw(device, family_index)?;
        Ok(Self {
            raw,
            family_index,
            buffers: Vec::new(),
        })
    }

    pub fn raw(&self) -> vk::CommandPool {
        self.raw
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Allocate a primary command buffer and begin recording it.
    ///
    /// # Safety
    ///
    /// Unsafe because the pool must only be used by one thread at a time.
    pub unsafe fn begin_buffer(
        &mut self,
        device: &ash::Device,
    ) -> Result<CommandBuffer, RenderError> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.raw)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let raw = device.allocate_command_buffers(&info)?[0];
        self.buffers.push(raw);
        device.begin_command_buffer(
            raw,
            &vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
        )?;
        Ok(CommandBuffer {
            raw,
            family_index: self.family_index,
        })
    }

    /// Free every recorded buffer.
    ///
    /// With `release` the Vulkan pool is destroyed and created again for the
    /// same family so its memory goes back to the driver.
    ///
    /// # Safety
    ///
    /// Unsafe because none of the pool's buffers may be pending.
    pub unsafe fn reset(
        &mut self,
        device: &ash::Device,
        release: bool,
    ) -> Result<(), RenderError> {
        if !self.buffers.is_empty() {
            device.free_command_buffers(self.raw, &self.buffers);
            self.buffers.clear();
        }
        if release {
            device.destroy_command_pool(self.raw, None);
            self.raw = Self::create_raw(device, self.family_index)?;
        } else {
            device.reset_command_pool(
                self.raw,
                vk::CommandPoolResetFlags::empty(),
            )?;
        }
        Ok(())
    }

    /// # Safety
    ///
    /// Unsafe because none of the pool's buffers may be pending.
    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_command_pool(self.raw, None);
    }

    unsafe fn create_raw(
        device: &ash::Device,
        family_index: u32,
    ) -> Result<vk::CommandPool, RenderError> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(family_index);
        Ok(device.create_command_pool(&info, None)?)
    }
}

/// A command buffer in the recording state.
#[derive(Debug, Copy, Clone)]
pub struct CommandBuffer {
    raw: vk::CommandBuffer,
    family_index: u32,
}

impl CommandBuffer {
    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// # Safety
    ///
    /// Unsafe because the buffer must be in the recording state.
    pub unsafe fn end(&self, device: &ash::Device) -> Result<(), RenderError> {
        device.end_command_buffer(self.raw)?;
        Ok(())
    }

    /// Record harvested ownership-transfer barriers.
    ///
    /// # Safety
    ///
    /// Unsafe because the buffer must be in the recording state.
    pub unsafe fn barriers(
        &self,
        device: &ash::Device,
        barriers: &[PendingBarrier],
    ) {
        if barriers.is_empty() {
            return;
        }
        let mut buffers = Vec::new();
        let mut images = Vec::new();
        for barrier in barriers {
            match barrier {
                PendingBarrier::Buffer(barrier) => buffers.push(*barrier),
                PendingBarrier::Image(barrier) => images.push(*barrier),
            }
        }
        device.cmd_pipeline_barrier(
            self.raw,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &buffers,
            &images,
        );
    }
}
