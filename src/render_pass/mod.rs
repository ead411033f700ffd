//! Render-pass compilation.
//!
//! A declarative [PassData] is first compiled into a [PassPlan] without
//! touching the device, then the plan is turned into Vulkan objects. Compile
//! failures release everything which was already created.

mod compiler;
mod data;
mod descriptors;

use {
    crate::{
        device::{ComputePipeline, DeviceObject, GraphicPipeline},
        texture_set::TextureSetLayout,
        RenderError,
    },
    ash::vk,
};

pub use self::{
    compiler::{
        compile_pass, implicit_preserve, union_push_constants, LayoutPlan,
        PassPlan, SetPlan,
    },
    data::{
        AttachmentData, AttachmentRef, BindingData, ClearColor,
        DescriptorSetData, GraphicsKind, PassData, PassKind,
        PipelineLayoutData, PushConstantData, SubpassData, SubpassDependency,
    },
    descriptors::{
        plan_binding, BoundDescriptor, DescriptorBinding, DescriptorInfo,
        DescriptorPhase, DescriptorSink, DescriptorWriter, WriteBatch,
    },
};

/// A pipeline layout with its descriptor sets, allocated once per pass.
#[derive(Debug)]
pub struct PipelineLayout {
    pub name: String,
    pub raw: vk::PipelineLayout,
    pub pool: vk::DescriptorPool,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub sets: Vec<vk::DescriptorSet>,
    pub graphic_pipelines: Vec<GraphicPipeline>,
    pub compute_pipelines: Vec<ComputePipeline>,
    pub plan: LayoutPlan,
}

impl PipelineLayout {
    pub fn graphic_pipeline(&self, name: &str) -> Option<&GraphicPipeline> {
        self.graphic_pipelines
            .iter()
            .find(|pipeline| pipeline.name == name)
    }

    pub fn compute_pipeline(&self, name: &str) -> Option<&ComputePipeline> {
        self.compute_pipelines
            .iter()
            .find(|pipeline| pipeline.name == name)
    }

    fn collect_objects(self, objects: &mut Vec<DeviceObject>) {
        for pipeline in self.graphic_pipelines {
            objects.push(DeviceObject::Pipeline(pipeline.raw));
        }
        for pipeline in self.compute_pipelines {
            objects.push(DeviceObject::Pipeline(pipeline.raw));
        }
        objects.push(DeviceObject::PipelineLayout(self.raw));
        // the texture set layout is owned elsewhere and is never in this list
        for layout in self.set_layouts {
            objects.push(DeviceObject::DescriptorSetLayout(layout));
        }
        if self.pool != vk::DescriptorPool::null() {
            objects.push(DeviceObject::DescriptorPool(self.pool));
        }
    }
}

/// The compiled Vulkan objects of a pass.
#[derive(Debug)]
pub struct RenderPass {
    pub name: String,
    pub kind: PassKind,
    pub raw: vk::RenderPass,

    /// Used when the target image is not a swapchain image.
    pub alternate: Option<vk::RenderPass>,

    pub clear_values: Vec<ClearColor>,
    pub layouts: Vec<PipelineLayout>,
    pub async_pass: bool,
}

// Public API
// ----------

impl RenderPass {
    /// Compile a pass.
    ///
    /// # Safety
    ///
    /// Unsafe because the returned objects must be retired through
    /// [RenderPass::into_objects] before the device is destroyed.
    pub unsafe fn compile(
        device: &ash::Device,
        data: &PassData,
        texture_set: Option<&TextureSetLayout>,
    ) -> Result<Self, RenderError> {
        let plan = compile_pass(data)?;
        let mut pass = Self {
            name: data.name.clone(),
            kind: data.kind,
            raw: vk::RenderPass::null(),
            alternate: None,
            clear_values: plan.clear_values.clone(),
            layouts: vec![],
            async_pass: data.async_pass,
        };
        if let Err(err) = pass.build(device, data, &plan, texture_set) {
            log::error!("Unable to compile pass '{}': {}", data.name, err);
            let objects = pass.into_objects();
            destroy_objects(device, objects);
            return Err(err);
        }
        log::trace!(
            "Compiled pass '{}' with {} render passes and {} layouts",
            data.name,
            if pass.kind.has_render_pass() {
                plan.render_pass_count()
            } else {
                0
            },
            pass.layouts.len()
        );
        Ok(pass)
    }

    /// The render pass compatible with the target image.
    pub fn render_pass_for(&self, target_is_swapchain: bool) -> vk::RenderPass {
        match self.alternate {
            Some(alternate) if !target_is_swapchain => alternate,
            _ => self.raw,
        }
    }

    pub fn vk_clear_values(&self) -> Vec<vk::ClearValue> {
        self.clear_values.iter().map(ClearColor::as_vk).collect()
    }

    pub fn layout(&self, name: &str) -> Option<&PipelineLayout> {
        self.layouts.iter().find(|layout| layout.name == name)
    }

    /// Objects to retire once no frame uses the pass.
    pub fn into_objects(self) -> Vec<DeviceObject> {
        let mut objects = Vec::new();
        for layout in self.layouts {
            layout.collect_objects(&mut objects);
        }
        if let Some(alternate) = self.alternate {
            objects.push(DeviceObject::RenderPass(alternate));
        }
        if self.raw != vk::RenderPass::null() {
            objects.push(DeviceObject::RenderPass(self.raw));
        }
        objects
    }
}

// Private API
// -----------

impl RenderPass {
    unsafe fn build(
        &mut self,
        device: &ash::Device,
        data: &PassData,
        plan: &PassPlan,
        texture_set: Option<&TextureSetLayout>,
    ) -> Result<(), RenderError> {
        if data.kind.has_render_pass() {
            self.raw =
                create_render_pass(device, data, plan, &plan.attachments)?;
            if let Some(alternate) = &plan.alternate_attachments {
                self.alternate =
                    Some(create_render_pass(device, data, plan, alternate)?);
            }
        }

        for (layout_data, layout_plan) in data.layouts.iter().zip(&plan.layouts)
        {
            let mut layout = create_layout(device, layout_plan, texture_set)?;
            let built = build_pipelines(
                device,
                layout_data,
                &mut layout,
                self.raw,
            );
            self.layouts.push(layout);
            built?;
        }
        Ok(())
    }
}

unsafe fn create_render_pass(
    device: &ash::Device,
    data: &PassData,
    plan: &PassPlan,
    attachments: &[vk::AttachmentDescription],
) -> Result<vk::RenderPass, RenderError> {
    struct SubpassRefs {
        inputs: Vec<vk::AttachmentReference>,
        outputs: Vec<vk::AttachmentReference>,
        resolves: Vec<vk::AttachmentReference>,
        depth_stencil: Option<vk::AttachmentReference>,
    }
    let refs = data
        .subpasses
        .iter()
        .map(|subpass| {
            let as_vk = |refs: &[AttachmentRef]| {
                refs.iter().map(AttachmentRef::as_vk).collect::<Vec<_>>()
            };
            SubpassRefs {
                inputs: as_vk(&subpass.inputs),
                outputs: as_vk(&subpass.outputs),
                resolves: as_vk(&subpass.resolves),
                depth_stencil: subpass
                    .depth_stencil
                    .as_ref()
                    .map(AttachmentRef::as_vk),
            }
        })
        .collect::<Vec<_>>();

    let subpasses = refs
        .iter()
        .zip(&plan.preserve)
        .map(|(refs, preserve)| {
            let mut description = vk::SubpassDescription::default()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .input_attachments(&refs.inputs)
                .color_attachments(&refs.outputs)
                .preserve_attachments(preserve);
            if refs.resolves.len() == refs.outputs.len()
                && !refs.resolves.is_empty()
            {
                description = description.resolve_attachments(&refs.resolves);
            }
            if let Some(depth_stencil) = &refs.depth_stencil {
                description =
                    description.depth_stencil_attachment(depth_stencil);
            }
            description
        })
        .collect::<Vec<_>>();

    let dependencies = data
        .dependencies
        .iter()
        .map(SubpassDependency::as_vk)
        .collect::<Vec<_>>();

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    Ok(device.create_render_pass(&create_info, None)?)
}

unsafe fn create_layout(
    device: &ash::Device,
    plan: &LayoutPlan,
    texture_set: Option<&TextureSetLayout>,
) -> Result<PipelineLayout, RenderError> {
    let mut layout = PipelineLayout {
        name: plan.name.clone(),
        raw: vk::PipelineLayout::null(),
        pool: vk::DescriptorPool::null(),
        set_layouts: vec![],
        sets: vec![],
        graphic_pipelines: vec![],
        compute_pipelines: vec![],
        plan: plan.clone(),
    };
    if let Err(err) = fill_layout(device, plan, texture_set, &mut layout) {
        let mut objects = Vec::new();
        layout.collect_objects(&mut objects);
        destroy_objects(device, objects);
        return Err(err);
    }
    Ok(layout)
}

unsafe fn fill_layout(
    device: &ash::Device,
    plan: &LayoutPlan,
    texture_set: Option<&TextureSetLayout>,
    layout: &mut PipelineLayout,
) -> Result<(), RenderError> {
    for set in &plan.sets {
        let bindings = set
            .bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect::<Vec<_>>();
        let binding_flags = set.binding_flags();
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
                .binding_flags(&binding_flags);
        let mut create_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        if set.update_after_bind {
            let flags =
                vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL;
            create_info = create_info.flags(flags).push_next(&mut flags_info);
        }
        layout
            .set_layouts
            .push(device.create_descriptor_set_layout(&create_info, None)?);
    }

    if !plan.sets.is_empty() {
        let mut pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(plan.sets.len() as u32)
            .pool_sizes(&plan.pool_sizes);
        if plan.update_after_bind_pool {
            pool_info = pool_info
                .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND);
        }
        layout.pool = device.create_descriptor_pool(&pool_info, None)?;
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(layout.pool)
            .set_layouts(&layout.set_layouts);
        layout.sets = device
            .allocate_descriptor_sets(&allocate_info)
            .map_err(|err| match err {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY
                | vk::Result::ERROR_FRAGMENTED_POOL => {
                    RenderError::DescriptorPoolExhausted
                }
                other => other.into(),
            })?;
    }

    let mut all_layouts = layout.set_layouts.clone();
    if plan.appends_texture_set {
        match texture_set {
            Some(texture_set) => all_layouts.push(texture_set.raw()),
            None => {
                return Err(anyhow::anyhow!(
                    "Layout '{}' uses the texture set but none was provided",
                    plan.name
                )
                .into())
            }
        }
    }
    let push_constants = plan.push_constant_ranges();
    let create_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&all_layouts)
        .push_constant_ranges(&push_constants);
    layout.raw = device.create_pipeline_layout(&create_info, None)?;
    Ok(())
}

unsafe fn build_pipelines(
    device: &ash::Device,
    data: &PipelineLayoutData,
    layout: &mut PipelineLayout,
    render_pass: vk::RenderPass,
) -> Result<(), RenderError> {
    for info in &data.graphic_pipelines {
        let pipeline =
            GraphicPipeline::new(device, info, layout.raw, render_pass)?;
        layout.graphic_pipelines.push(pipeline);
    }
    for (name, shader) in &data.compute_pipelines {
        let pipeline =
            ComputePipeline::new(device, name.clone(), shader, layout.raw)?;
        layout.compute_pipelines.push(pipeline);
    }
    Ok(())
}

unsafe fn destroy_objects(device: &ash::Device, objects: Vec<DeviceObject>) {
    for object in objects {
        match object {
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
            DeviceObject::RenderPass(raw) => {
                device.destroy_render_pass(raw, None)
            }
            other => log::warn!("Unexpected pass object {:?}", other),
        }
    }
}
