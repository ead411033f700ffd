use {
    crate::{device::ShaderModule, RenderError},
    ash::vk::{self, Handle},
    std::sync::Arc,
};

/// Orders pipelines so that depth-writing pipelines come first, then
/// pipelines without blending, then by handle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PipelineKey {
    pub depth_write: bool,
    pub blend_enabled: bool,
    pub address: u64,
}

impl PartialOrd for PipelineKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PipelineKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .depth_write
            .cmp(&self.depth_write)
            .then(self.blend_enabled.cmp(&other.blend_enabled))
            .then(self.address.cmp(&other.address))
    }
}

#[derive(Debug, Copy, Clone)]
pub struct BlendInfo {
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
}

impl BlendInfo {
    pub fn alpha_blend() -> Self {
        Self {
            src_color: vk::BlendFactor::SRC_ALPHA,
            dst_color: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_op: vk::BlendOp::ADD,
        }
    }

    /// Multiplies the destination by the source color.
    pub fn modulate() -> Self {
        Self {
            src_color: vk::BlendFactor::DST_COLOR,
            dst_color: vk::BlendFactor::ZERO,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ZERO,
            dst_alpha: vk::BlendFactor::ONE,
            alpha_op: vk::BlendOp::ADD,
        }
    }

    fn attachment_state(
        blend: Option<BlendInfo>,
    ) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        match blend {
            None => state.blend_enable(false),
            Some(blend) => state
                .blend_enable(true)
                .src_color_blend_factor(blend.src_color)
                .dst_color_blend_factor(blend.dst_color)
                .color_blend_op(blend.color_op)
                .src_alpha_blend_factor(blend.src_alpha)
                .dst_alpha_blend_factor(blend.dst_alpha)
                .alpha_blend_op(blend.alpha_op),
        }
    }
}

/// Everything needed to build a graphics pipeline. Vertices are pulled from
/// storage buffers so there is no vertex input state.
#[derive(Clone)]
pub struct GraphicPipelineInfo {
    pub name: String,
    pub vertex: Arc<ShaderModule>,
    pub fragment: Arc<ShaderModule>,
    pub subpass: u32,
    pub color_attachment_count: u32,
    pub samples: vk::SampleCountFlags,
    pub topology: vk::PrimitiveTopology,
    pub depth_test: bool,
    pub depth_write: bool,
    pub blend: Option<BlendInfo>,
}

#[derive(Debug)]
pub struct GraphicPipeline {
    pub name: String,
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub depth_write: bool,
    pub blend_enabled: bool,
}

impl GraphicPipeline {
    /// Build a pipeline for a subpass of `render_pass`.
    ///
    /// # Safety
    ///
    /// Unsafe because the pipeline must be destroyed before the device.
    pub unsafe fn new(
        device: &ash::Device,
        info: &GraphicPipelineInfo,
        layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
    ) -> Result<Self, RenderError> {
        let vertex_entry = info.vertex.entry_name();
        let fragment_entry = info.fragment.entry_name();
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(info.vertex.raw)
                .name(&vertex_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(info.fragment.raw)
                .name(&fragment_entry),
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(info.topology);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(info.samples);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(info.depth_test)
            .depth_write_enable(info.depth_write)
            .depth_compare_op(vk::CompareOp::GREATER_OR_EQUAL);
        let attachments = (0..info.color_attachment_count)
            .map(|_| BlendInfo::attachment_state(info.blend))
            .collect::<Vec<_>>();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&attachments);
        let dynamic_states =
            [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(info.subpass);

        let raw = device
            .create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
            .map_err(|(_, err)| {
                log::error!(
                    "Unable to build pipeline '{}': {}",
                    info.name,
                    err
                );
                RenderError::from(err)
            })?[0];

        Ok(Self {
            name: info.name.clone(),
            raw,
            layout,
            depth_write: info.depth_write,
            blend_enabled: info.blend.is_some(),
        })
    }

    pub fn key(&self) -> PipelineKey {
        PipelineKey {
            depth_write: self.depth_write,
            blend_enabled: self.blend_enabled,
            address: self.raw.as_raw(),
        }
    }
}

#[derive(Debug)]
pub struct ComputePipeline {
    pub name: String,
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub local_size: [u32; 3],
}

impl ComputePipeline {
    /// # Safety
    ///
    /// Unsafe because the pipeline must be destroyed before the device.
    pub unsafe fn new(
        device: &ash::Device,
        name: impl Into<String>,
        shader: &ShaderModule,
        layout: vk::PipelineLayout,
    ) -> Result<Self, RenderError> {
        let name = name.into();
        let entry = shader.entry_name();
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.raw)
            .name(&entry);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);
        let raw = device
            .create_compute_pipelines(
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
            .map_err(|(_, err)| {
                log::error!("Unable to build pipeline '{}': {}", name, err);
                RenderError::from(err)
            })?[0];
        let local_size = shader
            .info
            .entry_points
            .first()
            .and_then(|entry| entry.local_size)
            .unwrap_or([1, 1, 1]);
        Ok(Self {
            name,
            raw,
            layout,
            local_size,
        })
    }

    /// Work groups needed to cover `extent` invocations.
    pub fn dispatch_size(&self, extent: [u32; 3]) -> [u32; 3] {
        [
            extent[0].div_ceil(self.local_size[0].max(1)),
            extent[1].div_ceil(self.local_size[1].max(1)),
            extent[2].div_ceil(self.local_size[2].max(1)),
        ]
    }
}
