use {ash::vk, std::time::Duration};

/// How a view produces and presents its frames.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum RenderMode {
    /// Render to an off-screen image and blit it into the swapchain.
    RenderImageOffscreen,

    /// Acquire a queue synchronously and present inline.
    PresentImmediate,

    /// Present only when an external v-sync tick arrives.
    FollowDisplayLink,

    /// Schedule frames only when the scene asks for one.
    #[default]
    RenderOnDemand,
}

/// A present mode preference which is resolved against what the surface
/// actually supports.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum PresentModePreference {
    #[default]
    Fifo,
    FifoRelaxed,
    Mailbox,
    Immediate,
}

impl PresentModePreference {
    pub fn as_vk(self) -> vk::PresentModeKHR {
        match self {
            PresentModePreference::Fifo => vk::PresentModeKHR::FIFO,
            PresentModePreference::FifoRelaxed => {
                vk::PresentModeKHR::FIFO_RELAXED
            }
            PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

/// Options chosen by the hosting process.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Use this physical device instead of the best scoring one.
    pub device_index: Option<usize>,

    /// Enable the Khronos validation layer.
    pub validation: bool,

    pub present_mode: PresentModePreference,

    /// The mode used right after a resize until the surface settles.
    pub fast_present_mode: PresentModePreference,

    pub render_mode: RenderMode,

    /// Delay frames which overshoot their budget so the frame rate stays
    /// even.
    pub flatten_frame_rate: bool,

    /// Serialize submissions of frames which share a render queue.
    pub enable_frame_emitter_barrier: bool,

    /// Map host-visible nodes as soon as they are allocated.
    pub persistent_mapping: bool,

    /// How often the loop fires timers and emits update events.
    pub update_interval: Duration,

    /// Worker thread count. Defaults to the smaller of the hardware
    /// concurrency and the graphics queue count.
    pub worker_count: Option<usize>,

    /// The most image views and framebuffers kept alive by the frame cache.
    pub frame_cache_capacity: usize,

    /// Presents with the fast present mode before the swapchain asks to be
    /// rebuilt with the preferred one.
    pub max_suboptimal_frames: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            device_index: None,
            validation: false,
            present_mode: PresentModePreference::Mailbox,
            fast_present_mode: PresentModePreference::Immediate,
            render_mode: RenderMode::default(),
            flatten_frame_rate: false,
            enable_frame_emitter_barrier: true,
            persistent_mapping: true,
            update_interval: Duration::from_secs_f64(1.0 / 60.0),
            worker_count: None,
            frame_cache_capacity: 64,
            max_suboptimal_frames: 24,
        }
    }
}

impl EngineOptions {
    /// The number of worker threads to start given the graphics queue count.
    pub fn resolve_worker_count(&self, graphics_queue_count: usize) -> usize {
        if let Some(count) = self.worker_count {
            return count.max(1);
        }
        let hardware = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        hardware.min(graphics_queue_count).max(1)
    }
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn defaults() {
        let options = EngineOptions::default();
        assert!(options.enable_frame_emitter_barrier);
        assert!(options.persistent_mapping);
        assert_eq!(
            options.update_interval,
            Duration::from_secs_f64(1.0 / 60.0)
        );
        assert_eq!(
            options.present_mode.as_vk(),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn worker_count_is_bounded_by_queues() {
        let mut options = EngineOptions::default();
        assert_eq!(options.resolve_worker_count(1), 1);
        options.worker_count = Some(0);
        assert_eq!(options.resolve_worker_count(4), 1);
        options.worker_count = Some(3);
        assert_eq!(options.resolve_worker_count(1), 3);
    }
}
