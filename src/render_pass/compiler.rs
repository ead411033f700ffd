use {
    crate::{
        render_pass::{
            BindingData, ClearColor, PassData, PipelineLayoutData,
            PushConstantData,
        },
        RenderError,
    },
    anyhow::anyhow,
    ash::vk,
    std::collections::{BTreeMap, HashSet},
};

/// Everything needed to create the Vulkan objects for a pass, computed
/// without touching the device.
#[derive(Debug, Clone)]
pub struct PassPlan {
    pub attachments: Vec<vk::AttachmentDescription>,

    /// The same attachments with PRESENT_SRC final layouts replaced by
    /// TRANSFER_SRC_OPTIMAL. Only present when some attachment presents.
    pub alternate_attachments: Option<Vec<vk::AttachmentDescription>>,

    /// One entry per attachment. Attachments which are not cleared still get
    /// an entry so indices line up.
    pub clear_values: Vec<ClearColor>,

    /// Attachments each subpass must preserve.
    pub preserve: Vec<Vec<u32>>,

    pub layouts: Vec<LayoutPlan>,
}

impl PassPlan {
    pub fn render_pass_count(&self) -> usize {
        if self.alternate_attachments.is_some() {
            2
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SetPlan {
    pub bindings: Vec<BindingData>,
    pub update_after_bind: bool,
}

impl SetPlan {
    pub fn binding_flags(&self) -> Vec<vk::DescriptorBindingFlags> {
        self.bindings
            .iter()
            .map(|binding| {
                if binding.update_after_bind {
                    vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                } else {
                    vk::DescriptorBindingFlags::empty()
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct LayoutPlan {
    pub name: String,
    pub sets: Vec<SetPlan>,
    pub pool_sizes: Vec<vk::DescriptorPoolSize>,
    pub update_after_bind_pool: bool,
    pub push_constants: Vec<PushConstantData>,
    pub appends_texture_set: bool,
}

impl LayoutPlan {
    pub fn push_constant_ranges(&self) -> Vec<vk::PushConstantRange> {
        self.push_constants
            .iter()
            .map(|range| vk::PushConstantRange {
                stage_flags: range.stages,
                offset: range.offset,
                size: range.size,
            })
            .collect()
    }
}

/// Compile a pass description into a plan.
pub fn compile_pass(data: &PassData) -> Result<PassPlan, RenderError> {
    validate_references(data)?;
    validate_bindings(data)?;

    let attachments = data
        .attachments
        .iter()
        .map(|attachment| vk::AttachmentDescription {
            flags: vk::AttachmentDescriptionFlags::empty(),
            format: attachment.format,
            samples: attachment.samples,
            load_op: attachment.load_op,
            store_op: attachment.store_op,
            stencil_load_op: attachment.stencil_load_op,
            stencil_store_op: attachment.stencil_store_op,
            initial_layout: attachment.initial_layout,
            final_layout: attachment.final_layout,
        })
        .collect::<Vec<_>>();

    let presents = attachments.iter().any(|attachment| {
        attachment.final_layout == vk::ImageLayout::PRESENT_SRC_KHR
    });
    let alternate_attachments = presents.then(|| {
        attachments
            .iter()
            .map(|attachment| {
                let mut alternate = *attachment;
                if alternate.final_layout == vk::ImageLayout::PRESENT_SRC_KHR {
                    alternate.final_layout =
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
                }
                alternate
            })
            .collect()
    });

    let clear_values = data
        .attachments
        .iter()
        .map(|attachment| attachment.clear)
        .collect();

    Ok(PassPlan {
        attachments,
        alternate_attachments,
        clear_values,
        preserve: implicit_preserve(data),
        layouts: data.layouts.iter().map(plan_layout).collect(),
    })
}

/// Attachments used by non-contiguous subpasses are preserved by every
/// subpass in between which does not use them.
pub fn implicit_preserve(data: &PassData) -> Vec<Vec<u32>> {
    let mut preserve = data
        .subpasses
        .iter()
        .map(|subpass| {
            subpass
                .preserve
                .iter()
                .map(|index| *index as u32)
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    for attachment in 0..data.attachments.len() {
        let users = data
            .subpasses
            .iter()
            .enumerate()
            .filter(|(_, subpass)| subpass.uses(attachment))
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        let (Some(first), Some(last)) = (users.first(), users.last()) else {
            continue;
        };
        for index in *first + 1..*last {
            if !data.subpasses[index].uses(attachment)
                && !preserve[index].contains(&(attachment as u32))
            {
                preserve[index].push(attachment as u32);
            }
        }
    }
    preserve
}

/// Merge push constant ranges whose stage masks overlap.
pub fn union_push_constants(
    ranges: &[PushConstantData],
) -> Vec<PushConstantData> {
    let mut merged: Vec<PushConstantData> = Vec::new();
    for range in ranges {
        let mut current = *range;
        // merging can make a range overlap ones which were disjoint before
        while let Some(index) = merged
            .iter()
            .position(|other| other.stages.intersects(current.stages))
        {
            let other = merged.swap_remove(index);
            let end = (current.offset + current.size)
                .max(other.offset + other.size);
            current.stages |= other.stages;
            current.offset = current.offset.min(other.offset);
            current.size = end - current.offset;
        }
        merged.push(current);
    }
    merged.sort_by_key(|range| (range.offset, range.stages.as_raw()));
    merged
}

// Private API
// -----------

fn plan_layout(data: &PipelineLayoutData) -> LayoutPlan {
    let mut pool_sizes = BTreeMap::<i32, u32>::new();
    let sets = data
        .sets
        .iter()
        .map(|set| {
            for binding in &set.bindings {
                let ty = binding.descriptor_type.as_raw();
                *pool_sizes.entry(ty).or_default() += binding.count;
            }
            SetPlan {
                bindings: set.bindings.clone(),
                update_after_bind: set
                    .bindings
                    .iter()
                    .any(|binding| binding.update_after_bind),
            }
        })
        .collect::<Vec<SetPlan>>();
    let update_after_bind_pool = sets.iter().any(|set| set.update_after_bind);

    LayoutPlan {
        name: data.name.clone(),
        pool_sizes: pool_sizes
            .into_iter()
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty: vk::DescriptorType::from_raw(ty),
                descriptor_count,
            })
            .collect(),
        sets,
        update_after_bind_pool,
        push_constants: union_push_constants(&data.push_constants),
        appends_texture_set: data.uses_texture_set,
    }
}

fn validate_references(data: &PassData) -> Result<(), RenderError> {
    let count = data.attachments.len();
    for subpass in &data.subpasses {
        let references = subpass
            .inputs
            .iter()
            .chain(&subpass.outputs)
            .chain(&subpass.resolves)
            .chain(&subpass.depth_stencil);
        for reference in references {
            if reference.attachment >= count {
                return Err(anyhow!(
                    "Subpass '{}' of pass '{}' references attachment {} of {}",
                    subpass.name,
                    data.name,
                    reference.attachment,
                    count
                )
                .into());
            }
        }
    }
    let subpasses = data.subpasses.len() as u32;
    for dependency in &data.dependencies {
        let out_of_range = [dependency.src, dependency.dst]
            .into_iter()
            .flatten()
            .any(|index| index >= subpasses);
        if out_of_range {
            return Err(anyhow!(
                "Pass '{}' has a dependency on a missing subpass: {:?}",
                data.name,
                dependency
            )
            .into());
        }
    }
    Ok(())
}

fn validate_bindings(data: &PassData) -> Result<(), RenderError> {
    for layout in &data.layouts {
        for (set_index, set) in layout.sets.iter().enumerate() {
            let mut seen = HashSet::new();
            for binding in &set.bindings {
                if !seen.insert(binding.binding) {
                    return Err(anyhow!(
                        "Set {} of layout '{}' reuses binding {} for '{}'",
                        set_index,
                        layout.name,
                        binding.binding,
                        binding.name
                    )
                    .into());
                }
            }
        }
    }
    Ok(())
}
