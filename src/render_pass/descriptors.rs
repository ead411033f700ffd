//! Per-frame descriptor writes.
//!
//! Bindings without update-after-bind are written on the loop thread before
//! the frame records. Update-after-bind bindings are written on a worker
//! while the command buffer records, and always before submission.

use {ash::vk, std::sync::Arc};

/// The contents of one descriptor array element.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorInfo {
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
}

/// Anything which can fill a descriptor binding, usually an attachment
/// handle of the frame.
pub trait DescriptorBinding: Send + Sync {
    fn descriptor_array_size(&self) -> u32;

    /// True when element `index` changed since the last write.
    fn is_descriptor_dirty(&self, index: u32) -> bool;

    fn descriptor(&self, index: u32) -> DescriptorInfo;
}

/// When a binding is written relative to command recording.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DescriptorPhase {
    /// On the loop thread, before recording starts.
    Sync,

    /// On a worker, while recording.
    Async,
}

/// A binding of an allocated descriptor set and where its contents come
/// from.
#[derive(Clone)]
pub struct BoundDescriptor {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub update_after_bind: bool,
    pub source: Arc<dyn DescriptorBinding>,
}

impl BoundDescriptor {
    pub fn phase(&self) -> DescriptorPhase {
        if self.update_after_bind {
            DescriptorPhase::Async
        } else {
            DescriptorPhase::Sync
        }
    }
}

/// A contiguous run of dirty elements, written with one
/// `VkWriteDescriptorSet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub first_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub infos: Vec<DescriptorInfo>,
}

/// The destination of descriptor writes.
pub trait DescriptorSink: Send + Sync {
    /// # Safety
    ///
    /// Unsafe because sets which are not update-after-bind must not be in
    /// use by the GPU.
    unsafe fn write_batches(&self, batches: &[WriteBatch]);
}

impl DescriptorSink for ash::Device {
    unsafe fn write_batches(&self, batches: &[WriteBatch]) {
        if batches.is_empty() {
            return;
        }
        let image_infos = batches
            .iter()
            .map(|batch| {
                batch
                    .infos
                    .iter()
                    .filter_map(|info| match *info {
                        DescriptorInfo::Image {
                            view,
                            layout,
                            sampler,
                        } => Some(vk::DescriptorImageInfo {
                            sampler,
                            image_view: view,
                            image_layout: layout,
                        }),
                        DescriptorInfo::Buffer { .. } => None,
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let buffer_infos = batches
            .iter()
            .map(|batch| {
                batch
                    .infos
                    .iter()
                    .filter_map(|info| match *info {
                        DescriptorInfo::Buffer {
                            buffer,
                            offset,
                            range,
                        } => Some(vk::DescriptorBufferInfo {
                            buffer,
                            offset,
                            range,
                        }),
                        DescriptorInfo::Image { .. } => None,
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let writes = batches
            .iter()
            .enumerate()
            .map(|(index, batch)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(batch.set)
                    .dst_binding(batch.binding)
                    .dst_array_element(batch.first_element)
                    .descriptor_type(batch.descriptor_type);
                if image_infos[index].is_empty() {
                    write.buffer_info(&buffer_infos[index])
                } else {
                    write.image_info(&image_infos[index])
                }
            })
            .collect::<Vec<_>>();
        ash::Device::update_descriptor_sets(self, &writes, &[]);
    }
}

/// Batch the dirty elements of one binding. A clean element ends the
/// current batch and the next batch starts at the following dirty index.
pub fn plan_binding(target: &BoundDescriptor) -> Vec<WriteBatch> {
    let mut batches = Vec::new();
    let mut current: Option<WriteBatch> = None;
    for index in 0..target.source.descriptor_array_size() {
        if !target.source.is_descriptor_dirty(index) {
            batches.extend(current.take());
            continue;
        }
        let info = target.source.descriptor(index);
        match &mut current {
            Some(batch) => batch.infos.push(info),
            None => {
                current = Some(WriteBatch {
                    set: target.set,
                    binding: target.binding,
                    first_element: index,
                    descriptor_type: target.descriptor_type,
                    infos: vec![info],
                })
            }
        }
    }
    batches.extend(current);
    batches
}

/// The descriptor bindings a pass writes every frame.
#[derive(Clone, Default)]
pub struct DescriptorWriter {
    targets: Vec<BoundDescriptor>,
}

impl DescriptorWriter {
    pub fn add(&mut self, target: BoundDescriptor) {
        self.targets.push(target);
    }

    pub fn has_phase(&self, phase: DescriptorPhase) -> bool {
        self.targets.iter().any(|target| target.phase() == phase)
    }

    pub fn plan(&self, phase: DescriptorPhase) -> Vec<WriteBatch> {
        self.targets
            .iter()
            .filter(|target| target.phase() == phase)
            .flat_map(plan_binding)
            .collect()
    }

    /// Write every binding of `phase`. Returns the number of batches.
    ///
    /// # Safety
    ///
    /// Unsafe for the reasons given by [DescriptorSink::write_batches].
    pub unsafe fn write(
        &self,
        phase: DescriptorPhase,
        sink: &dyn DescriptorSink,
    ) -> usize {
        let batches = self.plan(phase);
        log::trace!("Writing {} {:?} descriptor batches", batches.len(), phase);
        sink.write_batches(&batches);
        batches.len()
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        ash::vk::Handle,
        pretty_assertions::assert_eq,
        std::sync::Mutex,
    };

    struct Buffers {
        dirty: Vec<bool>,
    }

    impl DescriptorBinding for Buffers {
        fn descriptor_array_size(&self) -> u32 {
            self.dirty.len() as u32
        }

        fn is_descriptor_dirty(&self, index: u32) -> bool {
            self.dirty[index as usize]
        }

        fn descriptor(&self, index: u32) -> DescriptorInfo {
            DescriptorInfo::Buffer {
                buffer: vk::Buffer::from_raw(index as u64 + 1),
                offset: 0,
                range: vk::WHOLE_SIZE,
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<WriteBatch>>,
    }

    impl DescriptorSink for Recorder {
        unsafe fn write_batches(&self, batches: &[WriteBatch]) {
            self.batches.lock().unwrap().extend_from_slice(batches);
        }
    }

    fn target(dirty: Vec<bool>, update_after_bind: bool) -> BoundDescriptor {
        BoundDescriptor {
            set: vk::DescriptorSet::from_raw(1),
            binding: if update_after_bind { 1 } else { 0 },
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            update_after_bind,
            source: Arc::new(Buffers { dirty }),
        }
    }

    #[test]
    fn clean_elements_split_batches() {
        let batches =
            plan_binding(&target(vec![true, true, false, true, false], false));
        assert_eq!(
            batches
                .iter()
                .map(|batch| (batch.first_element, batch.infos.len()))
                .collect::<Vec<_>>(),
            vec![(0, 2), (3, 1)]
        );
    }

    #[test]
    fn phases_write_separately() {
        let mut writer = DescriptorWriter::default();
        writer.add(target(vec![true, false], false));
        writer.add(target(vec![true, true], true));
        assert!(writer.has_phase(DescriptorPhase::Async));

        let recorder = Recorder::default();
        let written = unsafe { writer.write(DescriptorPhase::Sync, &recorder) };
        assert_eq!(written, 1);
        assert_eq!(recorder.batches.lock().unwrap()[0].binding, 0);

        let written =
            unsafe { writer.write(DescriptorPhase::Async, &recorder) };
        assert_eq!(written, 1);
        let batches = recorder.batches.lock().unwrap();
        assert_eq!(batches[1].binding, 1);
        assert_eq!(batches[1].infos.len(), 2);
    }
}
