use {
    crate::device::PipelineKey,
    ash::vk,
    bytemuck::{Pod, Zeroable},
    std::{collections::HashMap, sync::Arc},
};

pub type MaterialId = u32;
pub type StateId = u32;
pub type Mat4 = [[f32; 4]; 4];

pub const IDENTITY: Mat4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// One vertex as the material shaders read it from the vertex buffer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 4],
    pub color: [f32; 4],
    pub uv: [f32; 2],

    /// Object id, a glyph id for atlas materials.
    pub object: u32,

    /// The transform index, packed into both halves.
    pub material: u32,
}

impl Vertex {
    pub fn new(pos: [f32; 2], color: [f32; 4], uv: [f32; 2]) -> Self {
        Self {
            pos: [pos[0], pos[1], 0.0, 1.0],
            color,
            uv,
            object: 0,
            material: 0,
        }
    }
}

/// Per-instance data read from the transform buffer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
pub struct TransformObject {
    pub transform: Mat4,

    /// `z` holds the z-path depth.
    pub offset: [f32; 4],

    /// `x` holds the command's shadow value.
    pub shadow: [f32; 4],
}

impl TransformObject {
    pub fn new(transform: Mat4, depth: f32, shadow: f32) -> Self {
        Self {
            transform,
            offset: [0.0, 0.0, depth, 0.0],
            shadow: [shadow, 0.0, 0.0, 0.0],
        }
    }
}

/// Indexed triangles shared between commands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// A position in the scene's layering tree. Compared lexicographically, so
/// a parent sorts before its children and children before later siblings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZPath(pub Vec<i16>);

impl From<&[i16]> for ZPath {
    fn from(path: &[i16]) -> Self {
        Self(path.to_vec())
    }
}

/// An explicit request to draw in a particular group.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum RenderingLevel {
    /// Decided by the material's pipeline.
    #[default]
    Default,
    Solid,
    Surface,
    Transparent,
}

/// Geometry drawn with one transform.
#[derive(Debug, Clone)]
pub struct TransformedData {
    pub transform: Mat4,
    pub data: Arc<VertexData>,
}

/// Common fields of every draw command.
#[derive(Debug, Clone, Default)]
pub struct CommandHeader {
    pub material: MaterialId,
    pub state: StateId,
    pub zpath: ZPath,

    /// Written to the transform buffer as the shadow value.
    pub depth_value: f32,

    pub rendering: RenderingLevel,
}

#[derive(Debug, Clone)]
pub enum Command {
    VertexArray {
        header: CommandHeader,
        spans: Vec<TransformedData>,
    },

    /// Instanced geometry whose transform is `view * model`. Normalized
    /// geometry is already in clip space and skips the view transform.
    Deferred {
        header: CommandHeader,
        normalized: bool,
        view: Mat4,
        model: Mat4,
        data: Arc<VertexData>,
    },

    ShadowArray {
        header: CommandHeader,
        spans: Vec<TransformedData>,
    },

    ShadowDeferred {
        header: CommandHeader,
        normalized: bool,
        view: Mat4,
        model: Mat4,
        data: Arc<VertexData>,
    },
}

impl Command {
    pub fn header(&self) -> &CommandHeader {
        match self {
            Command::VertexArray { header, .. }
            | Command::Deferred { header, .. }
            | Command::ShadowArray { header, .. }
            | Command::ShadowDeferred { header, .. } => header,
        }
    }

    pub fn is_shadow(&self) -> bool {
        matches!(
            self,
            Command::ShadowArray { .. } | Command::ShadowDeferred { .. }
        )
    }

    /// Every (transform, geometry) pair the command draws.
    pub fn transformed(&self) -> Vec<TransformedData> {
        match self {
            Command::VertexArray { spans, .. }
            | Command::ShadowArray { spans, .. } => spans.clone(),
            Command::Deferred {
                normalized,
                view,
                model,
                data,
                ..
            }
            | Command::ShadowDeferred {
                normalized,
                view,
                model,
                data,
                ..
            } => {
                let transform = if *normalized {
                    *model
                } else {
                    mul(view, model)
                };
                vec![TransformedData {
                    transform,
                    data: data.clone(),
                }]
            }
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
    pub struct StateFlags: u32 {
        const SCISSOR = 1 << 0;
    }
}

/// Draw state shared by commands with the same state id.
#[derive(Debug, Copy, Clone, Default)]
pub struct DrawState {
    pub flags: StateFlags,
    pub scissor: Option<vk::Rect2D>,
}

impl DrawState {
    /// The scissor to apply, if scissoring is enabled.
    pub fn active_scissor(&self) -> Option<vk::Rect2D> {
        if self.flags.contains(StateFlags::SCISSOR) {
            self.scissor
        } else {
            None
        }
    }
}

/// The commands of one frame plus the states they refer to.
#[derive(Debug, Clone, Default)]
pub struct CommandList {
    pub commands: Vec<Command>,
    pub states: HashMap<StateId, DrawState>,
}

impl CommandList {
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn set_state(&mut self, id: StateId, state: DrawState) {
        self.states.insert(id, state);
    }
}

/// Where a glyph lives in its atlas.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AtlasEntry {
    /// `[u0, v0, u1, v1]`
    pub uv: [f32; 4],

    /// Offset of the glyph's origin in screen units.
    pub offset: [f32; 2],

    /// Size of the glyph in screen units.
    pub size: [f32; 2],
}

/// A font atlas. Vertices of atlas materials carry a glyph id in `object`
/// and the quad corner (0 or 1 per axis) in `uv`.
#[derive(Debug, Clone, Default)]
pub struct GlyphAtlas {
    pub entries: HashMap<u32, AtlasEntry>,
}

/// What the builder needs to know about a material.
#[derive(Debug, Clone)]
pub struct MaterialInfo {
    pub id: MaterialId,
    pub pipeline: PipelineKey,

    /// Index of the texture set layout the pipeline uses.
    pub layout_index: u32,

    pub atlas: Option<Arc<GlyphAtlas>>,
}

/// The materials a command list may refer to.
#[derive(Debug, Clone, Default)]
pub struct MaterialSet {
    materials: HashMap<MaterialId, MaterialInfo>,
}

impl MaterialSet {
    pub fn insert(&mut self, material: MaterialInfo) {
        self.materials.insert(material.id, material);
    }

    pub fn get(&self, id: MaterialId) -> Option<&MaterialInfo> {
        self.materials.get(&id)
    }
}

/// Column-major 4x4 product `a * b`.
pub fn mul(a: &Mat4, b: &Mat4) -> Mat4 {
    let mut out = [[0.0; 4]; 4];
    for (column, out_column) in out.iter_mut().enumerate() {
        for (row, value) in out_column.iter_mut().enumerate() {
            *value = (0..4).map(|k| a[k][row] * b[column][k]).sum();
        }
    }
    out
}
