use {
    crate::device::{GraphicPipelineInfo, ShaderModule},
    ash::vk,
    std::sync::Arc,
};

/// What a graphics pass draws.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GraphicsKind {
    /// Arbitrary subpasses recorded by the host.
    Generic,

    /// Draw-plan driven material rendering.
    Material,

    /// Merges the shadow buffers into the color output.
    ShadowMerge,
}

/// The kinds of pass a render queue can hold.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PassKind {
    Transfer,
    Generic,
    Graphics(GraphicsKind),
    Compute,
}

impl PassKind {
    /// Only graphics passes own a Vulkan render pass.
    pub fn has_render_pass(&self) -> bool {
        matches!(self, PassKind::Graphics(_))
    }
}

/// The clear value used when an attachment is loaded with CLEAR.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ClearColor {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearColor {
    pub fn as_vk(&self) -> vk::ClearValue {
        match *self {
            ClearColor::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearColor::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentData {
    pub name: String,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    pub clear: ClearColor,
}

impl AttachmentData {
    /// A color attachment which is cleared and stored.
    pub fn color(
        name: impl Into<String>,
        format: vk::Format,
        final_layout: vk::ImageLayout,
        clear: [f32; 4],
    ) -> Self {
        Self {
            name: name.into(),
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout,
            clear: ClearColor::Color(clear),
        }
    }

    /// A transient depth-stencil attachment cleared to zero depth.
    pub fn depth_stencil(name: impl Into<String>, format: vk::Format) -> Self {
        Self {
            name: name.into(),
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::CLEAR,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            clear: ClearColor::DepthStencil {
                depth: 0.0,
                stencil: 0,
            },
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.load_op == vk::AttachmentLoadOp::CLEAR
            || self.stencil_load_op == vk::AttachmentLoadOp::CLEAR
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AttachmentRef {
    pub attachment: usize,
    pub layout: vk::ImageLayout,
}

impl AttachmentRef {
    pub fn new(attachment: usize, layout: vk::ImageLayout) -> Self {
        Self { attachment, layout }
    }

    pub fn as_vk(&self) -> vk::AttachmentReference {
        vk::AttachmentReference {
            attachment: self.attachment as u32,
            layout: self.layout,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubpassData {
    pub name: String,
    pub inputs: Vec<AttachmentRef>,
    pub outputs: Vec<AttachmentRef>,
    pub resolves: Vec<AttachmentRef>,
    pub depth_stencil: Option<AttachmentRef>,
    pub preserve: Vec<usize>,
}

impl SubpassData {
    /// True when any reference in this subpass names `attachment`.
    pub fn uses(&self, attachment: usize) -> bool {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .chain(&self.resolves)
            .chain(&self.depth_stencil)
            .any(|reference| reference.attachment == attachment)
    }
}

/// A dependency between subpasses. `None` is the external scope.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SubpassDependency {
    pub src: Option<u32>,
    pub dst: Option<u32>,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub by_region: bool,
}

impl SubpassDependency {
    pub fn as_vk(&self) -> vk::SubpassDependency {
        vk::SubpassDependency {
            src_subpass: self.src.unwrap_or(vk::SUBPASS_EXTERNAL),
            dst_subpass: self.dst.unwrap_or(vk::SUBPASS_EXTERNAL),
            src_stage_mask: self.src_stage,
            dst_stage_mask: self.dst_stage,
            src_access_mask: self.src_access,
            dst_access_mask: self.dst_access,
            dependency_flags: if self.by_region {
                vk::DependencyFlags::BY_REGION
            } else {
                vk::DependencyFlags::empty()
            },
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BindingData {
    pub name: String,

    /// The binding number within its set. Numbers may be sparse.
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,

    /// Written on a worker while the frame records, after the set is bound.
    pub update_after_bind: bool,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DescriptorSetData {
    pub bindings: Vec<BindingData>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PushConstantData {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Default)]
pub struct PipelineLayoutData {
    pub name: String,
    pub sets: Vec<DescriptorSetData>,
    pub push_constants: Vec<PushConstantData>,

    /// Append the bindless texture set as the last descriptor set.
    pub uses_texture_set: bool,

    pub graphic_pipelines: Vec<GraphicPipelineInfo>,
    pub compute_pipelines: Vec<(String, Arc<ShaderModule>)>,
}

/// The declarative description of one pass.
#[derive(Clone)]
pub struct PassData {
    pub name: String,
    pub kind: PassKind,
    pub attachments: Vec<AttachmentData>,
    pub subpasses: Vec<SubpassData>,
    pub dependencies: Vec<SubpassDependency>,
    pub layouts: Vec<PipelineLayoutData>,

    /// Async passes do not wait for the previous frame's submission.
    pub async_pass: bool,
}

impl PassData {
    pub fn new(name: impl Into<String>, kind: PassKind) -> Self {
        Self {
            name: name.into(),
            kind,
            attachments: vec![],
            subpasses: vec![],
            dependencies: vec![],
            layouts: vec![],
            async_pass: false,
        }
    }
}
