use {
    super::{
        builder::{DrawPlan, VertexSpan},
        commands::{CommandList, StateId},
        scissor::{full_scissor, remap_scissor},
    },
    crate::device::PipelineKey,
    ash::vk::{self, Handle},
};

/// The commands a draw loop issues.
pub trait DrawRecorder {
    fn bind_pipeline(&mut self, pipeline: PipelineKey, layout_index: u32);

    fn bind_texture_set(&mut self, layout_index: u32);

    fn set_scissor(&mut self, scissor: vk::Rect2D);

    fn draw_indexed(&mut self, index_count: u32, first_index: u32);
}

/// What a recorded draw loop did.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct RecordStat {
    pub pipeline_binds: u32,
    pub texture_set_binds: u32,
    pub scissor_changes: u32,
    pub draws: u32,
}

/// Issue the plan's spans, binding pipelines and texture sets only when
/// they change between spans.
///
/// Scissors are given in the logical frame of size `extent` and get
/// remapped through `transform`.
pub fn record_draws(
    plan: &DrawPlan,
    list: &CommandList,
    transform: vk::SurfaceTransformFlagsKHR,
    extent: vk::Extent2D,
    recorder: &mut dyn DrawRecorder,
) -> RecordStat {
    let mut stat = RecordStat::default();
    let mut pipeline: Option<PipelineKey> = None;
    let mut layout: Option<u32> = None;
    let mut scissor: Option<vk::Rect2D> = None;

    for span in &plan.spans {
        if pipeline != Some(span.pipeline) {
            recorder.bind_pipeline(span.pipeline, span.layout_index);
            pipeline = Some(span.pipeline);
            stat.pipeline_binds += 1;
        }
        if layout != Some(span.layout_index) {
            recorder.bind_texture_set(span.layout_index);
            layout = Some(span.layout_index);
            stat.texture_set_binds += 1;
        }
        let wanted = span_scissor(span, list, transform, extent);
        if scissor != Some(wanted) {
            recorder.set_scissor(wanted);
            scissor = Some(wanted);
            stat.scissor_changes += 1;
        }
        recorder.draw_indexed(span.index_count, span.first_index);
        stat.draws += 1;
    }
    stat
}

fn span_scissor(
    span: &VertexSpan,
    list: &CommandList,
    transform: vk::SurfaceTransformFlagsKHR,
    extent: vk::Extent2D,
) -> vk::Rect2D {
    scissor_for_state(span.state, list)
        .map(|rect| remap_scissor(rect, transform, extent))
        .unwrap_or_else(|| full_scissor(transform, extent))
}

fn scissor_for_state(state: StateId, list: &CommandList) -> Option<vk::Rect2D> {
    list.states
        .get(&state)
        .and_then(|state| state.active_scissor())
}

/// Records into a Vulkan command buffer.
///
/// Pipelines are identified by the raw handle in their [PipelineKey].
/// `layouts` and `sets` are indexed by texture set layout index.
pub struct CommandBufferRecorder<'a> {
    device: &'a ash::Device,
    command_buffer: vk::CommandBuffer,
    layouts: &'a [vk::PipelineLayout],
    sets: &'a [vk::DescriptorSet],
    bound_layout: u32,
}

impl<'a> CommandBufferRecorder<'a> {
    /// # Safety
    ///
    /// Unsafe because the command buffer must be recording inside a render
    /// pass and the vertex, index and transform buffers must be bound.
    pub unsafe fn new(
        device: &'a ash::Device,
        command_buffer: vk::CommandBuffer,
        layouts: &'a [vk::PipelineLayout],
        sets: &'a [vk::DescriptorSet],
    ) -> Self {
        Self {
            device,
            command_buffer,
            layouts,
            sets,
            bound_layout: 0,
        }
    }
}

impl<'a> DrawRecorder for CommandBufferRecorder<'a> {
    fn bind_pipeline(&mut self, pipeline: PipelineKey, layout_index: u32) {
        self.bound_layout = layout_index;
        unsafe {
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                vk::Pipeline::from_raw(pipeline.address),
            );
        }
    }

    fn bind_texture_set(&mut self, layout_index: u32) {
        let (Some(&layout), Some(&set)) = (
            self.layouts.get(layout_index as usize),
            self.sets.get(layout_index as usize),
        ) else {
            log::warn!("No texture set for layout {}", layout_index);
            return;
        };
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                &[],
            );
        }
    }

    fn set_scissor(&mut self, scissor: vk::Rect2D) {
        unsafe {
            self.device
                .cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.command_buffer,
                index_count,
                1,
                first_index,
                0,
                0,
            );
        }
    }
}
