use {
    super::{
        commands::{
            Command, CommandList, GlyphAtlas, MaterialId, MaterialInfo,
            MaterialSet, Mat4, RenderingLevel, StateId, TransformObject,
            TransformedData, Vertex, ZPath, IDENTITY,
        },
        scissor::{fullscreen_quad, QUAD_INDICES},
    },
    crate::{
        device::PipelineKey,
        memory::{Allocator, MappedRegion, MemBlock},
        RenderError,
    },
    anyhow::anyhow,
    ash::vk,
    std::collections::BTreeMap,
};

/// The groups a plan draws, in draw order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum DrawGroup {
    /// Pipelines which write depth.
    Solid,

    /// Explicitly requested surface level.
    Surface,

    /// Everything else, in z-path order.
    Transparent,
}

/// Counters describing a built plan. The full-screen quad is not counted.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct DrawStat {
    pub vertexes: u32,
    pub triangles: u32,
    pub draw_calls: u32,
    pub solid_cmds: u32,
    pub surface_cmds: u32,
    pub transparent_cmds: u32,
    pub shadow_triangles: u32,
}

/// One `vkCmdDrawIndexed` of the plan.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VertexSpan {
    pub group: DrawGroup,
    pub pipeline: PipelineKey,
    pub layout_index: u32,
    pub material: MaterialId,
    pub state: StateId,
    pub first_index: u32,
    pub index_count: u32,
}

impl VertexSpan {
    /// The key spans are sorted by inside their group.
    pub fn sort_key(&self) -> (PipelineKey, u32, MaterialId, StateId) {
        (self.pipeline, self.layout_index, self.material, self.state)
    }
}

/// Depths for a set of z-paths: earlier paths get larger depths, all in
/// (0, 1].
///
/// A path outside the set takes the depth of the closest path before it,
/// or 1.0 when there is none.
#[derive(Debug, Clone, Default)]
pub struct ZPathDepths {
    depths: BTreeMap<ZPath, f32>,
}

impl ZPathDepths {
    pub fn assign<'a>(paths: impl IntoIterator<Item = &'a ZPath>) -> Self {
        let mut sorted = paths.into_iter().cloned().collect::<Vec<_>>();
        sorted.sort();
        sorted.dedup();
        let count = sorted.len() as f32;
        let depths = sorted
            .into_iter()
            .enumerate()
            .map(|(index, path)| (path, (count - index as f32) / (count + 1.0)))
            .collect();
        Self { depths }
    }

    pub fn depth(&self, path: &ZPath) -> f32 {
        self.depths
            .range::<ZPath, _>(..=path)
            .next_back()
            .map_or(1.0, |(_, depth)| *depth)
    }

    /// Depths in path order.
    pub fn ordered(&self) -> Vec<f32> {
        self.depths.values().copied().collect()
    }
}

/// The buffers and spans for one frame's command list.
#[derive(Debug, Clone, Default)]
pub struct DrawPlan {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub transforms: Vec<TransformObject>,

    /// Indices of occluder triangles for the shadow pass, into the same
    /// vertex buffer.
    pub shadow_indices: Vec<u32>,

    /// The full-screen quad, drawn at transform 0 by the clear and shadow
    /// merge pipelines.
    pub quad: (u32, u32),

    pub spans: Vec<VertexSpan>,
    pub stat: DrawStat,
}

impl DrawPlan {
    pub fn vertex_bytes(&self) -> u64 {
        std::mem::size_of_val(self.vertices.as_slice()) as u64
    }

    pub fn index_bytes(&self) -> u64 {
        std::mem::size_of_val(self.indices.as_slice()) as u64
    }

    pub fn transform_bytes(&self) -> u64 {
        std::mem::size_of_val(self.transforms.as_slice()) as u64
    }

    /// Copy the plan into host-visible blocks. Non-coherent blocks are
    /// flushed.
    ///
    /// # Safety
    ///
    /// Unsafe because the GPU must not be reading the blocks.
    pub unsafe fn upload(
        &self,
        allocator: &Allocator,
        vertices: MemBlock,
        indices: MemBlock,
        transforms: MemBlock,
    ) -> Result<(), RenderError> {
        copy_into(allocator, vertices, &self.vertices)?;
        copy_into(allocator, indices, &self.indices)?;
        copy_into(allocator, transforms, &self.transforms)?;
        Ok(())
    }
}

unsafe fn copy_into<T: bytemuck::Pod>(
    allocator: &Allocator,
    block: MemBlock,
    data: &[T],
) -> Result<(), RenderError> {
    let mut region = MappedRegion::<T>::new(allocator, block)?;
    if region.len() < data.len() {
        return Err(anyhow!(
            "{} {} do not fit into {:?}",
            data.len(),
            std::any::type_name::<T>(),
            block
        )
        .into());
    }
    region[..data.len()].copy_from_slice(data);
    Ok(())
}

struct Bucket<'a> {
    material: &'a MaterialInfo,
    state: StateId,
    commands: Vec<&'a Command>,
}

/// Builds a [DrawPlan] from a command list.
pub struct DrawPlanBuilder<'a> {
    materials: &'a MaterialSet,
    surface_transform: vk::SurfaceTransformFlagsKHR,
}

impl<'a> DrawPlanBuilder<'a> {
    pub fn new(materials: &'a MaterialSet) -> Self {
        Self {
            materials,
            surface_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        }
    }

    pub fn with_surface_transform(
        mut self,
        transform: vk::SurfaceTransformFlagsKHR,
    ) -> Self {
        self.surface_transform = transform;
        self
    }

    pub fn build(&self, list: &CommandList) -> DrawPlan {
        let mut plan = DrawPlan::default();

        // transform 0 and the first vertices belong to the full-screen quad
        plan.transforms.push(TransformObject::new(IDENTITY, 1.0, 0.0));
        plan.vertices
            .extend_from_slice(&fullscreen_quad(self.surface_transform));
        plan.indices.extend_from_slice(&QUAD_INDICES);
        plan.quad = (0, QUAD_INDICES.len() as u32);

        let mut groups: BTreeMap<DrawGroup, Vec<&Command>> = BTreeMap::new();
        let mut shadows = Vec::new();
        for command in &list.commands {
            if command.is_shadow() {
                shadows.push(command);
                continue;
            }
            let header = command.header();
            let Some(material) = self.materials.get(header.material) else {
                log::warn!(
                    "Skipping command with unknown material {}",
                    header.material
                );
                continue;
            };
            let group = classify(header.rendering, material);
            match group {
                DrawGroup::Solid => plan.stat.solid_cmds += 1,
                DrawGroup::Surface => plan.stat.surface_cmds += 1,
                DrawGroup::Transparent => plan.stat.transparent_cmds += 1,
            }
            groups.entry(group).or_default().push(command);
        }

        // only drawn commands take a depth, shadows reuse their occluder's
        let depths = ZPathDepths::assign(
            groups
                .values()
                .flatten()
                .map(|command| &command.header().zpath),
        );

        for (group, mut commands) in groups {
            if group == DrawGroup::Transparent {
                commands
                    .sort_by(|a, b| a.header().zpath.cmp(&b.header().zpath));
            }
            for bucket in self.buckets(&commands) {
                self.emit_bucket(&mut plan, group, &bucket, &depths);
            }
        }

        for command in shadows {
            let header = command.header();
            let depth = depths.depth(&header.zpath);
            for transformed in command.transformed() {
                let (_, count) = write_geometry(
                    &mut plan,
                    &transformed,
                    depth,
                    header.depth_value,
                    None,
                    true,
                );
                plan.stat.shadow_triangles += count / 3;
            }
        }

        log::trace!("Draw plan: {:?}", plan.stat);
        plan
    }
}

impl<'a> DrawPlanBuilder<'a> {
    /// Group commands by (material, state), ordered by pipeline, layout,
    /// material and state.
    fn buckets<'c>(&self, commands: &[&'c Command]) -> Vec<Bucket<'c>>
    where
        'a: 'c,
    {
        let mut buckets: BTreeMap<
            (PipelineKey, u32, MaterialId, StateId),
            Bucket<'c>,
        > = BTreeMap::new();
        for &command in commands {
            let header = command.header();
            let Some(material) = self.materials.get(header.material) else {
                continue;
            };
            let key = (
                material.pipeline,
                material.layout_index,
                material.id,
                header.state,
            );
            buckets
                .entry(key)
                .or_insert_with(|| Bucket {
                    material,
                    state: header.state,
                    commands: Vec::new(),
                })
                .commands
                .push(command);
        }
        buckets.into_values().collect()
    }

    fn emit_bucket(
        &self,
        plan: &mut DrawPlan,
        group: DrawGroup,
        bucket: &Bucket<'_>,
        depths: &ZPathDepths,
    ) {
        let first_index = plan.indices.len() as u32;
        for command in &bucket.commands {
            let header = command.header();
            let depth = depths.depth(&header.zpath);
            for transformed in command.transformed() {
                let (vertexes, indices) = write_geometry(
                    plan,
                    &transformed,
                    depth,
                    header.depth_value,
                    bucket.material.atlas.as_deref(),
                    false,
                );
                plan.stat.vertexes += vertexes;
                plan.stat.triangles += indices / 3;
            }
        }
        let index_count = plan.indices.len() as u32 - first_index;
        if index_count == 0 {
            return;
        }
        plan.stat.draw_calls += 1;
        plan.spans.push(VertexSpan {
            group,
            pipeline: bucket.material.pipeline,
            layout_index: bucket.material.layout_index,
            material: bucket.material.id,
            state: bucket.state,
            first_index,
            index_count,
        });
    }
}

fn classify(level: RenderingLevel, material: &MaterialInfo) -> DrawGroup {
    match level {
        RenderingLevel::Surface => DrawGroup::Surface,
        RenderingLevel::Transparent => DrawGroup::Transparent,
        RenderingLevel::Solid => DrawGroup::Solid,
        RenderingLevel::Default if material.pipeline.depth_write => {
            DrawGroup::Solid
        }
        RenderingLevel::Default => DrawGroup::Transparent,
    }
}

/// Append one transform's geometry. Returns the vertex and index counts.
///
/// Geometry with an index past its vertices is skipped.
fn write_geometry(
    plan: &mut DrawPlan,
    transformed: &TransformedData,
    depth: f32,
    shadow: f32,
    atlas: Option<&GlyphAtlas>,
    shadow_pass: bool,
) -> (u32, u32) {
    let vertex_count = transformed.data.vertices.len();
    let out_of_range = transformed
        .data
        .indices
        .iter()
        .find(|index| **index as usize >= vertex_count);
    if let Some(index) = out_of_range {
        log::warn!(
            "Skipping geometry: index {} with only {} vertices",
            index,
            vertex_count
        );
        return (0, 0);
    }

    let transform_index = plan.transforms.len() as u32;
    plan.transforms.push(TransformObject::new(
        transformed.transform,
        depth,
        shadow,
    ));
    let base = plan.vertices.len() as u32;
    let material = transform_index | (transform_index << 16);
    let inverse = atlas.and_then(|_| inverse_2d(&transformed.transform));
    for vertex in &transformed.data.vertices {
        let mut vertex = *vertex;
        vertex.material = material;
        if let (Some(atlas), Some(inverse)) = (atlas, inverse) {
            resolve_glyph(&mut vertex, atlas, &inverse);
        }
        plan.vertices.push(vertex);
    }
    let indices = transformed.data.indices.iter().map(|index| index + base);
    if shadow_pass {
        plan.shadow_indices.extend(indices);
    } else {
        plan.indices.extend(indices);
    }
    (
        transformed.data.vertices.len() as u32,
        transformed.data.indices.len() as u32,
    )
}

/// Replace the glyph corner with atlas coordinates and move the vertex so
/// the glyph stays axis aligned on screen after the transform is applied.
fn resolve_glyph(
    vertex: &mut Vertex,
    atlas: &GlyphAtlas,
    inverse: &[[f32; 2]; 2],
) {
    let Some(entry) = atlas.entries.get(&vertex.object) else {
        return;
    };
    let corner = vertex.uv;
    vertex.uv = [
        entry.uv[0] + (entry.uv[2] - entry.uv[0]) * corner[0],
        entry.uv[1] + (entry.uv[3] - entry.uv[1]) * corner[1],
    ];
    let offset = [
        entry.offset[0] + entry.size[0] * corner[0],
        entry.offset[1] + entry.size[1] * corner[1],
    ];
    vertex.pos[0] += inverse[0][0] * offset[0] + inverse[1][0] * offset[1];
    vertex.pos[1] += inverse[0][1] * offset[0] + inverse[1][1] * offset[1];
}

/// The inverse of the upper-left 2x2 block of a column-major transform.
fn inverse_2d(transform: &Mat4) -> Option<[[f32; 2]; 2]> {
    let (a, b) = (transform[0][0], transform[0][1]);
    let (c, d) = (transform[1][0], transform[1][1]);
    let det = a * d - c * b;
    if det.abs() <= f32::EPSILON {
        return None;
    }
    Some([[d / det, -b / det], [-c / det, a / det]])
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::draw_plan::commands::{
            AtlasEntry, CommandHeader, VertexData,
        },
        pretty_assertions::assert_eq,
        std::sync::Arc,
    };

    fn key(
        depth_write: bool,
        blend_enabled: bool,
        address: u64,
    ) -> PipelineKey {
        PipelineKey {
            depth_write,
            blend_enabled,
            address,
        }
    }

    fn materials() -> MaterialSet {
        let mut set = MaterialSet::default();
        set.insert(MaterialInfo {
            id: 0,
            pipeline: key(true, false, 10),
            layout_index: 0,
            atlas: None,
        });
        set.insert(MaterialInfo {
            id: 1,
            pipeline: key(false, true, 20),
            layout_index: 0,
            atlas: None,
        });
        set.insert(MaterialInfo {
            id: 2,
            pipeline: key(true, false, 5),
            layout_index: 1,
            atlas: None,
        });
        set
    }

    fn triangle() -> Arc<VertexData> {
        let white = [1.0; 4];
        Arc::new(VertexData {
            vertices: vec![
                Vertex::new([-1.0, -1.0], white, [0.0, 0.0]),
                Vertex::new([1.0, -1.0], white, [1.0, 0.0]),
                Vertex::new([0.0, 1.0], white, [0.5, 1.0]),
            ],
            indices: vec![0, 1, 2],
        })
    }

    fn array(material: MaterialId, zpath: &[i16]) -> Command {
        Command::VertexArray {
            header: CommandHeader {
                material,
                zpath: ZPath(zpath.to_vec()),
                ..CommandHeader::default()
            },
            spans: vec![TransformedData {
                transform: IDENTITY,
                data: triangle(),
            }],
        }
    }

    #[test]
    fn one_triangle_makes_one_draw() {
        let materials = materials();
        let mut list = CommandList::default();
        list.push(array(0, &[0]));
        let plan = DrawPlanBuilder::new(&materials).build(&list);

        assert_eq!(plan.stat.vertexes, 3);
        assert_eq!(plan.stat.triangles, 1);
        assert_eq!(plan.stat.draw_calls, 1);
        assert_eq!(plan.stat.solid_cmds, 1);

        // the quad comes first
        assert_eq!(plan.quad, (0, 6));
        assert_eq!(plan.indices[6..], [4, 5, 6]);
        assert_eq!(plan.spans[0].first_index, 6);
        assert_eq!(plan.spans[0].index_count, 3);
        assert_eq!(plan.vertices[4].material, 1 | (1 << 16));
        assert_eq!(plan.transforms.len(), 2);
        assert_eq!(plan.transforms[1].offset[2], 0.5);
    }

    #[test]
    fn z_path_depths_decrease() {
        let paths = [ZPath(vec![1]), ZPath(vec![0, 1]), ZPath(vec![0])];
        let depths = ZPathDepths::assign(paths.iter());
        assert_eq!(depths.ordered(), vec![0.75, 0.5, 0.25]);
        assert_eq!(depths.depth(&ZPath(vec![0, 1])), 0.5);
    }

    #[test]
    fn spans_are_grouped_and_sorted() {
        let materials = materials();
        let mut list = CommandList::default();
        list.push(array(1, &[3]));
        list.push(array(0, &[2]));
        list.push(Command::VertexArray {
            header: CommandHeader {
                material: 0,
                rendering: RenderingLevel::Surface,
                ..CommandHeader::default()
            },
            spans: vec![TransformedData {
                transform: IDENTITY,
                data: triangle(),
            }],
        });
        list.push(array(2, &[1]));
        list.push(array(0, &[0]));

        let plan = DrawPlanBuilder::new(&materials).build(&list);
        let spans = plan
            .spans
            .iter()
            .map(|span| (span.group, span.material))
            .collect::<Vec<_>>();
        assert_eq!(
            spans,
            vec![
                (DrawGroup::Solid, 2),
                (DrawGroup::Solid, 0),
                (DrawGroup::Surface, 0),
                (DrawGroup::Transparent, 1),
            ]
        );
        // both solid commands of material 0 share one draw
        assert_eq!(plan.spans[1].index_count, 6);
        assert_eq!(plan.stat.draw_calls, 4);
        assert_eq!(plan.stat.transparent_cmds, 1);
    }

    #[test]
    fn z_paths_between_assigned_ones_take_the_earlier_depth() {
        let paths = [ZPath(vec![0]), ZPath(vec![2])];
        let depths = ZPathDepths::assign(paths.iter());
        assert_eq!(depths.depth(&ZPath(vec![0, 5])), depths.depth(&paths[0]));
        assert_eq!(depths.depth(&ZPath(vec![3])), depths.depth(&paths[1]));
        assert_eq!(depths.depth(&ZPath(vec![-1])), 1.0);
    }

    #[test]
    fn shadows_do_not_shift_drawn_depths() {
        let materials = materials();
        let mut list = CommandList::default();
        list.push(array(1, &[0]));
        list.push(array(1, &[2]));
        let plain = DrawPlanBuilder::new(&materials).build(&list);

        for zpath in [vec![1], vec![2], vec![3, 1]] {
            list.push(Command::ShadowArray {
                header: CommandHeader {
                    zpath: ZPath(zpath),
                    ..CommandHeader::default()
                },
                spans: vec![TransformedData {
                    transform: IDENTITY,
                    data: triangle(),
                }],
            });
        }
        let shadowed = DrawPlanBuilder::new(&materials).build(&list);

        let drawn = plain.transforms.len();
        assert_eq!(shadowed.transforms[..drawn], plain.transforms[..]);
        assert_eq!(shadowed.stat.shadow_triangles, 3);

        // each shadow sits at the depth of the command it follows
        let depth = |transform: &TransformObject| transform.offset[2];
        let shadows = &shadowed.transforms[drawn..];
        assert_eq!(depth(&shadows[0]), depth(&plain.transforms[1]));
        assert_eq!(depth(&shadows[1]), depth(&plain.transforms[2]));
        assert_eq!(depth(&shadows[2]), depth(&plain.transforms[2]));
    }

    #[test]
    fn out_of_range_indices_are_skipped() {
        let materials = materials();
        let mut list = CommandList::default();
        list.push(Command::VertexArray {
            header: CommandHeader::default(),
            spans: vec![TransformedData {
                transform: IDENTITY,
                data: Arc::new(VertexData {
                    vertices: triangle().vertices.clone(),
                    indices: vec![0, 1, 3],
                }),
            }],
        });
        list.push(array(0, &[1]));
        let plan = DrawPlanBuilder::new(&materials).build(&list);

        assert_eq!(plan.stat.triangles, 1);
        assert_eq!(plan.stat.vertexes, 3);
        assert_eq!(plan.transforms.len(), 2);
        assert!(plan
            .indices
            .iter()
            .all(|index| (*index as usize) < plan.vertices.len()));
    }

    #[test]
    fn shadows_are_counted_separately() {
        let materials = materials();
        let mut list = CommandList::default();
        list.push(Command::ShadowArray {
            header: CommandHeader::default(),
            spans: vec![TransformedData {
                transform: IDENTITY,
                data: triangle(),
            }],
        });
        let plan = DrawPlanBuilder::new(&materials).build(&list);
        assert_eq!(plan.stat.shadow_triangles, 1);
        assert_eq!(plan.stat.draw_calls, 0);
        assert_eq!(plan.shadow_indices, vec![4, 5, 6]);
    }

    #[test]
    fn glyphs_resolve_through_the_atlas() {
        let mut atlas = GlyphAtlas::default();
        atlas.entries.insert(
            7,
            AtlasEntry {
                uv: [0.5, 0.0, 1.0, 0.25],
                offset: [0.0, 0.0],
                size: [2.0, 4.0],
            },
        );
        let mut materials = MaterialSet::default();
        materials.insert(MaterialInfo {
            id: 3,
            pipeline: key(false, true, 1),
            layout_index: 0,
            atlas: Some(Arc::new(atlas)),
        });

        let mut corner = Vertex::new([0.0, 0.0], [1.0; 4], [1.0, 1.0]);
        corner.object = 7;
        let mut scale = IDENTITY;
        scale[0][0] = 2.0;
        scale[1][1] = 2.0;
        let mut list = CommandList::default();
        list.push(Command::VertexArray {
            header: CommandHeader {
                material: 3,
                ..CommandHeader::default()
            },
            spans: vec![TransformedData {
                transform: scale,
                data: Arc::new(VertexData {
                    vertices: vec![corner],
                    indices: vec![0, 0, 0],
                }),
            }],
        });

        let plan = DrawPlanBuilder::new(&materials).build(&list);
        let glyph = plan.vertices[4];
        assert_eq!(glyph.uv, [1.0, 0.25]);
        assert_eq!(glyph.pos[0], 1.0);
        assert_eq!(glyph.pos[1], 2.0);
    }
}
