use {crate::memory::MemNode, ash::vk, std::collections::VecDeque};

/// A device object which is waiting to be destroyed.
#[derive(Debug)]
pub enum DeviceObject {
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    Framebuffer(vk::Framebuffer),
    RenderPass(vk::RenderPass),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    DescriptorPool(vk::DescriptorPool),
    ShaderModule(vk::ShaderModule),
    Semaphore(vk::Semaphore),
    CommandPool(vk::CommandPool),
    Swapchain(vk::SwapchainKHR),
    Memory(MemNode),
}

/// Objects retired by a frame are destroyed once that frame completes.
///
/// Frames complete in order, so the queue only needs the order of the
/// newest completed frame.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    entries: VecDeque<(u64, DeviceObject)>,
}

impl DeferredQueue {
    /// Queue `object` for destruction after the frame with order
    /// `frame_order` completes.
    pub fn retire(&mut self, frame_order: u64, object: DeviceObject) {
        // keep the queue sorted so collection can stop early
        let position = self
            .entries
            .iter()
            .rposition(|(order, _)| *order <= frame_order)
            .map_or(0, |index| index + 1);
        self.entries.insert(position, (frame_order, object));
    }

    /// Destroy every object retired at or before `completed_order`.
    pub fn collect(
        &mut self,
        completed_order: u64,
        mut destroy: impl FnMut(DeviceObject),
    ) -> usize {
        let mut count = 0;
        while let Some((order, _)) = self.entries.front() {
            if *order > completed_order {
                break;
            }
            if let Some((_, object)) = self.entries.pop_front() {
                destroy(object);
                count += 1;
            }
        }
        count
    }

    /// Destroy everything, used when the device is idle.
    pub fn drain(&mut self, destroy: impl FnMut(DeviceObject)) -> usize {
        self.collect(u64::MAX, destroy)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use {super::*, ash::vk::Handle, pretty_assertions::assert_eq};

    #[test]
    fn objects_are_destroyed_after_their_frame() {
        let mut queue = DeferredQueue::default();
        queue.retire(3, DeviceObject::Buffer(vk::Buffer::from_raw(3)));
        queue.retire(1, DeviceObject::Buffer(vk::Buffer::from_raw(1)));
        queue.retire(2, DeviceObject::Sampler(vk::Sampler::from_raw(2)));

        let mut destroyed = Vec::new();
        assert_eq!(queue.collect(0, |object| destroyed.push(object)), 0);
        assert_eq!(queue.collect(2, |object| destroyed.push(object)), 2);
        assert!(matches!(destroyed[0], DeviceObject::Buffer(_)));
        assert!(matches!(destroyed[1], DeviceObject::Sampler(_)));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.drain(|_| ()), 1);
        assert!(queue.is_empty());
    }
}
