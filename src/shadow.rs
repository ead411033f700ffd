//! Two-dimensional shadows.
//!
//! A compute pass reads occluder triangles and the scene's lights and
//! writes one distance buffer per light into an image array. A graphics
//! pass then draws the full-screen quad with a merge pipeline which
//! modulates the color output by the lit amount. Without lights the null
//! variant of the merge pipeline is bound instead.

use {
    crate::{
        device::{BlendInfo, GraphicPipelineInfo, ShaderModule},
        render_pass::{
            AttachmentData, AttachmentRef, BindingData, DescriptorSetData,
            GraphicsKind, PassData, PassKind, PipelineLayoutData,
            PushConstantData, SubpassData,
        },
        RenderError,
    },
    anyhow::anyhow,
    ash::vk,
    bytemuck::{Pod, Zeroable},
    std::sync::Arc,
};

pub const SHADOW_PIPELINE: &str = "shadow";
pub const MERGE_PIPELINE: &str = "shadow_merge";
pub const NULL_MERGE_PIPELINE: &str = "shadow_merge_null";

/// A point light as the shadow shaders read it.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
pub struct Light {
    /// `xy` in frame coordinates, `z` the height over the scene, `w` the
    /// radius of the light's disk.
    pub position: [f32; 4],
    pub color: [f32; 4],
}

impl Light {
    pub fn new(
        position: [f32; 2],
        height: f32,
        radius: f32,
        color: [f32; 4],
    ) -> Self {
        Self {
            position: [position[0], position[1], height, radius],
            color,
        }
    }
}

/// The header at the start of the light buffer, followed by the lights.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
pub struct ShadowHeader {
    pub ambient: [f32; 4],
    pub light_count: u32,
    pub triangle_count: u32,
    pub grid_width: u32,
    pub grid_height: u32,

    /// Size of the frame the lights are positioned in.
    pub extent: [f32; 2],

    /// Shadow buffer texels per frame unit.
    pub density: f32,
    pub _padding: f32,
}

/// Which merge pipeline a frame binds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ShadowVariant {
    /// No lights: blend with the ambient color only.
    Null,
    Lit,
}

impl ShadowVariant {
    pub fn merge_pipeline(&self) -> &'static str {
        match self {
            ShadowVariant::Null => NULL_MERGE_PIPELINE,
            ShadowVariant::Lit => MERGE_PIPELINE,
        }
    }

    /// The compute pass only runs for lit frames.
    pub fn runs_compute(&self) -> bool {
        *self == ShadowVariant::Lit
    }
}

/// The lights of one frame.
#[derive(Debug, Clone)]
pub struct LightSet {
    pub ambient: [f32; 4],
    pub lights: Vec<Light>,

    /// Shadow buffer texels per frame unit.
    pub density: f32,
}

impl Default for LightSet {
    fn default() -> Self {
        Self {
            ambient: [1.0; 4],
            lights: vec![],
            density: 0.5,
        }
    }
}

impl LightSet {
    pub fn add(&mut self, light: Light) {
        self.lights.push(light);
    }

    pub fn variant(&self) -> ShadowVariant {
        if self.lights.is_empty() {
            ShadowVariant::Null
        } else {
            ShadowVariant::Lit
        }
    }

    /// The size of one shadow buffer layer for a frame of `extent`.
    pub fn buffer_extent(&self, extent: vk::Extent2D) -> vk::Extent2D {
        let scale =
            |value: u32| ((value as f32 * self.density).ceil() as u32).max(1);
        vk::Extent2D {
            width: scale(extent.width),
            height: scale(extent.height),
        }
    }

    /// The light buffer contents: the header followed by every light.
    pub fn pack(&self, extent: vk::Extent2D, triangle_count: u32) -> Vec<u8> {
        let grid = self.buffer_extent(extent);
        let header = ShadowHeader {
            ambient: self.ambient,
            light_count: self.lights.len() as u32,
            triangle_count,
            grid_width: grid.width,
            grid_height: grid.height,
            extent: [extent.width as f32, extent.height as f32],
            density: self.density,
            _padding: 0.0,
        };
        let mut bytes = bytemuck::bytes_of(&header).to_vec();
        bytes.extend_from_slice(bytemuck::cast_slice(&self.lights));
        bytes
    }

    pub fn packed_size(&self) -> u64 {
        (std::mem::size_of::<ShadowHeader>()
            + std::mem::size_of_val(self.lights.as_slice())) as u64
    }
}

/// Group counts for the shadow compute pass: one layer per light.
pub fn dispatch_size(
    grid: vk::Extent2D,
    light_count: u32,
    local_size: [u32; 3],
) -> [u32; 3] {
    let groups = |value: u32, local: u32| value.div_ceil(local.max(1));
    [
        groups(grid.width, local_size[0]),
        groups(grid.height, local_size[1]),
        groups(light_count.max(1), local_size[2]),
    ]
}

/// The compute shader's local size, as declared by its entry point.
pub fn local_size(shader: &ShaderModule) -> Result<[u32; 3], RenderError> {
    shader
        .info
        .entry_points
        .first()
        .and_then(|entry| entry.local_size)
        .ok_or_else(|| {
            anyhow!("shadow shader does not declare a local size").into()
        })
}

/// The compute pass which fills the shadow buffers.
///
/// Bindings are the vertex buffer, the shadow index buffer, the light
/// buffer and the storage image array.
pub fn shadow_pass_data(shader: Arc<ShaderModule>) -> PassData {
    let storage_buffer = |name: &str, binding| BindingData {
        name: name.to_owned(),
        binding,
        descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
        count: 1,
        stages: vk::ShaderStageFlags::COMPUTE,
        update_after_bind: false,
    };
    let mut data = PassData::new("shadow", PassKind::Compute);
    data.layouts.push(PipelineLayoutData {
        name: "shadow".to_owned(),
        sets: vec![DescriptorSetData {
            bindings: vec![
                storage_buffer("vertices", 0),
                storage_buffer("indices", 1),
                storage_buffer("lights", 2),
                BindingData {
                    name: "shadow_buffers".to_owned(),
                    binding: 3,
                    descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                    count: 1,
                    stages: vk::ShaderStageFlags::COMPUTE,
                    update_after_bind: false,
                },
            ],
        }],
        push_constants: vec![],
        uses_texture_set: false,
        graphic_pipelines: vec![],
        compute_pipelines: vec![(SHADOW_PIPELINE.to_owned(), shader)],
    });
    data
}

/// The graphics pass which merges the shadow buffers into `color`.
///
/// Both pipelines draw the full-screen quad and modulate the color
/// attachment.
pub fn merge_pass_data(
    color: AttachmentData,
    vertex: Arc<ShaderModule>,
    fragment: Arc<ShaderModule>,
    null_fragment: Arc<ShaderModule>,
) -> PassData {
    let samples = color.samples;
    let merge_info = |name: &str, fragment: Arc<ShaderModule>| {
        GraphicPipelineInfo {
            name: name.to_owned(),
            vertex: vertex.clone(),
            fragment,
            subpass: 0,
            color_attachment_count: 1,
            samples,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            depth_test: false,
            depth_write: false,
            blend: Some(BlendInfo::modulate()),
        }
    };

    let mut color = color;
    color.load_op = vk::AttachmentLoadOp::LOAD;
    if color.initial_layout == vk::ImageLayout::UNDEFINED {
        color.initial_layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
    }

    let mut data = PassData::new(
        "shadow_merge",
        PassKind::Graphics(GraphicsKind::ShadowMerge),
    );
    data.layouts.push(PipelineLayoutData {
        name: "shadow_merge".to_owned(),
        sets: vec![DescriptorSetData {
            bindings: vec![
                BindingData {
                    name: "vertices".to_owned(),
                    binding: 0,
                    descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                    count: 1,
                    stages: vk::ShaderStageFlags::VERTEX,
                    update_after_bind: false,
                },
                BindingData {
                    name: "shadow_buffers".to_owned(),
                    binding: 1,
                    descriptor_type:
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    count: 1,
                    stages: vk::ShaderStageFlags::FRAGMENT,
                    update_after_bind: false,
                },
            ],
        }],
        push_constants: vec![PushConstantData {
            stages: vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: std::mem::size_of::<[f32; 4]>() as u32,
        }],
        uses_texture_set: false,
        graphic_pipelines: vec![
            merge_info(MERGE_PIPELINE, fragment),
            merge_info(NULL_MERGE_PIPELINE, null_fragment),
        ],
        compute_pipelines: vec![],
    });
    data.attachments.push(color);
    data.subpasses.push(SubpassData {
        name: "merge".to_owned(),
        outputs: vec![AttachmentRef::new(
            0,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )],
        ..SubpassData::default()
    });
    data
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            device::{EntryPoint, ShaderInfo},
            render_pass::compile_pass,
        },
        pretty_assertions::assert_eq,
    };

    fn shader(
        stage: vk::ShaderStageFlags,
        local_size: Option<[u32; 3]>,
    ) -> Arc<ShaderModule> {
        Arc::new(ShaderModule {
            raw: vk::ShaderModule::null(),
            info: ShaderInfo {
                stage,
                words: vec![],
                entry_points: vec![EntryPoint {
                    name: "main".to_owned(),
                    local_size,
                }],
                push_constants: vec![],
                specialization_constants: vec![],
            },
        })
    }

    const FRAME: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    #[test]
    fn no_lights_select_the_null_variant() {
        let mut lights = LightSet::default();
        assert_eq!(lights.variant(), ShadowVariant::Null);
        assert_eq!(lights.variant().merge_pipeline(), NULL_MERGE_PIPELINE);
        assert!(!lights.variant().runs_compute());

        lights.add(Light::new([10.0, 20.0], 5.0, 2.0, [1.0; 4]));
        assert_eq!(lights.variant(), ShadowVariant::Lit);
    }

    #[test]
    fn lights_pack_after_the_header() {
        let mut lights = LightSet::default();
        lights.add(Light::new([10.0, 20.0], 5.0, 2.0, [0.5; 4]));
        lights.add(Light::default());
        let bytes = lights.pack(FRAME, 12);

        assert_eq!(bytes.len() as u64, lights.packed_size());
        let header: ShadowHeader = bytemuck::pod_read_unaligned(
            &bytes[..std::mem::size_of::<ShadowHeader>()],
        );
        assert_eq!(header.light_count, 2);
        assert_eq!(header.triangle_count, 12);
        assert_eq!((header.grid_width, header.grid_height), (400, 300));

        let first: Light = bytemuck::pod_read_unaligned(
            &bytes[std::mem::size_of::<ShadowHeader>()..][..32],
        );
        assert_eq!(first.position, [10.0, 20.0, 5.0, 2.0]);
    }

    #[test]
    fn dispatch_covers_the_grid() {
        let grid = vk::Extent2D {
            width: 400,
            height: 301,
        };
        assert_eq!(dispatch_size(grid, 3, [32, 32, 1]), [13, 10, 3]);
        assert_eq!(dispatch_size(grid, 0, [32, 32, 1]), [13, 10, 1]);
    }

    #[test]
    fn local_size_comes_from_the_entry_point() {
        let compute = shader(vk::ShaderStageFlags::COMPUTE, Some([8, 8, 1]));
        assert_eq!(local_size(&compute).unwrap(), [8, 8, 1]);
        let vertex = shader(vk::ShaderStageFlags::VERTEX, None);
        assert!(local_size(&vertex).is_err());
    }

    #[test]
    fn passes_compile() {
        let compute = shadow_pass_data(shader(
            vk::ShaderStageFlags::COMPUTE,
            Some([8, 8, 1]),
        ));
        let plan = compile_pass(&compute).unwrap();
        assert!(plan.attachments.is_empty());
        assert_eq!(plan.layouts.len(), 1);

        let merge = merge_pass_data(
            AttachmentData::color(
                "color",
                vk::Format::B8G8R8A8_UNORM,
                vk::ImageLayout::PRESENT_SRC_KHR,
                [0.0; 4],
            ),
            shader(vk::ShaderStageFlags::VERTEX, None),
            shader(vk::ShaderStageFlags::FRAGMENT, None),
            shader(vk::ShaderStageFlags::FRAGMENT, None),
        );
        assert_eq!(merge.attachments[0].load_op, vk::AttachmentLoadOp::LOAD);
        let plan = compile_pass(&merge).unwrap();
        assert_eq!(plan.render_pass_count(), 2);
        assert_eq!(merge.layouts[0].graphic_pipelines.len(), 2);
    }
}
