//! Incremental texture set writes replayed against a model descriptor set.

use {
    anyhow::Result,
    assert2::check,
    ash::vk::{self, Handle},
    ccthw_render_core::texture_set::{
        DescriptorItems, DescriptorWrite, SlotState, TextureSet,
        TextureSetLayoutInfo, BUFFER_BINDING, IMAGE_BINDING,
    },
    pretty_assertions::assert_eq,
};

mod common;

const SLOTS: u32 = 48;

fn layout(partially_bound: bool) -> TextureSetLayoutInfo {
    TextureSetLayoutInfo {
        samplers: vec![vk::Sampler::from_raw(1)],
        image_count: SLOTS,
        buffer_count: SLOTS,
        partially_bound,
        update_after_bind: true,
    }
}

/// The descriptor set as the device would see it.
struct DeviceModel {
    images: Vec<SlotState<vk::ImageView>>,
    buffers: Vec<SlotState<vk::Buffer>>,
}

impl DeviceModel {
    fn new() -> Self {
        Self {
            images: vec![SlotState::Unwritten; SLOTS as usize],
            buffers: vec![SlotState::Unwritten; SLOTS as usize],
        }
    }

    fn apply(&mut self, writes: &[DescriptorWrite]) {
        for write in writes {
            let first = write.first_element as usize;
            match &write.items {
                DescriptorItems::Images(items) => {
                    assert_eq!(write.binding, IMAGE_BINDING);
                    for (slot, item) in items.iter().enumerate() {
                        self.images[first + slot] = to_state(*item);
                    }
                }
                DescriptorItems::Buffers(items) => {
                    assert_eq!(write.binding, BUFFER_BINDING);
                    for (slot, item) in items.iter().enumerate() {
                        self.buffers[first + slot] = to_state(*item);
                    }
                }
            }
        }
    }
}

fn to_state<T>(item: Option<T>) -> SlotState<T> {
    match item {
        Some(object) => SlotState::Bound(object),
        None => SlotState::Empty,
    }
}

/// What a shader sampling the slot would observe.
fn visible<T: Copy>(states: &[SlotState<T>]) -> Vec<Option<T>> {
    states
        .iter()
        .map(|state| match state {
            SlotState::Bound(object) => Some(*object),
            SlotState::Empty | SlotState::Unwritten => None,
        })
        .collect()
}

fn replay_matches_a_fresh_write(partially_bound: bool, seed: u64) {
    let mut rng = common::Lcg::new(seed);
    let info = layout(partially_bound);
    let mut set = TextureSet::new(vk::DescriptorSet::null(), &info);
    let mut device = DeviceModel::new();
    let mut requested_images = vec![None; SLOTS as usize];
    let mut requested_buffers = vec![None; SLOTS as usize];

    for step in 0..3_000 {
        let slot = rng.below(SLOTS as u64) as usize;
        let handle = 1 + rng.below(16);
        match rng.below(5) {
            0 => {
                set.set_image(slot, vk::ImageView::from_raw(handle));
                requested_images[slot] = Some(vk::ImageView::from_raw(handle));
            }
            1 => {
                set.clear_image(slot);
                requested_images[slot] = None;
            }
            2 => {
                set.set_buffer(slot, vk::Buffer::from_raw(handle));
                requested_buffers[slot] = Some(vk::Buffer::from_raw(handle));
            }
            3 => {
                set.clear_buffer(slot);
                requested_buffers[slot] = None;
            }
            _ => device.apply(&set.plan_writes()),
        }
        if step % 97 == 0 {
            device.apply(&set.plan_writes());
            check!(device.images == set.written_images());
            check!(device.buffers == set.written_buffers());
        }
    }
    device.apply(&set.plan_writes());

    let mut fresh = TextureSet::new(vk::DescriptorSet::null(), &info);
    for (slot, view) in requested_images.iter().enumerate() {
        if let Some(view) = view {
            fresh.set_image(slot, *view);
        }
    }
    for (slot, buffer) in requested_buffers.iter().enumerate() {
        if let Some(buffer) = buffer {
            fresh.set_buffer(slot, *buffer);
        }
    }
    let mut fresh_device = DeviceModel::new();
    fresh_device.apply(&fresh.plan_writes());

    assert_eq!(visible(&device.images), visible(&fresh_device.images));
    assert_eq!(visible(&device.buffers), visible(&fresh_device.buffers));
    assert_eq!(visible(&device.images), requested_images);
    if !partially_bound {
        // every slot holds something once a fully bound set is written
        check!(!device.images.contains(&SlotState::Unwritten));
        check!(device.images == fresh_device.images);
        check!(device.buffers == fresh_device.buffers);
    }

    // nothing is left to write
    check!(set.plan_writes().is_empty());
}

#[test]
pub fn partially_bound_replay_matches_a_fresh_write() -> Result<()> {
    common::setup_logger();
    for seed in 0..8 {
        replay_matches_a_fresh_write(true, seed);
    }
    Ok(())
}

#[test]
pub fn fully_bound_replay_matches_a_fresh_write() -> Result<()> {
    common::setup_logger();
    for seed in 0..8 {
        replay_matches_a_fresh_write(false, seed);
    }
    Ok(())
}

#[test]
pub fn only_three_slots_are_written_when_partially_bound() -> Result<()> {
    common::setup_logger();
    let info = TextureSetLayoutInfo {
        image_count: 16,
        buffer_count: 16,
        ..layout(true)
    };
    let mut set = TextureSet::new(vk::DescriptorSet::null(), &info);
    for slot in [0, 3, 7] {
        set.set_image(slot, vk::ImageView::from_raw(slot as u64 + 1));
    }
    let writes = set.plan_writes();
    check!(
        writes
            .iter()
            .map(|write| write.first_element)
            .collect::<Vec<_>>()
            == vec![0, 3, 7]
    );

    let mut full = TextureSet::new(
        vk::DescriptorSet::null(),
        &TextureSetLayoutInfo {
            partially_bound: false,
            ..info
        },
    );
    for slot in [0, 3, 7] {
        full.set_image(slot, vk::ImageView::from_raw(slot as u64 + 1));
    }
    let images = full
        .plan_writes()
        .into_iter()
        .filter(|write| write.binding == IMAGE_BINDING)
        .collect::<Vec<_>>();
    check!(images.len() == 1);
    check!(images[0].items.len() == 16);
    Ok(())
}
