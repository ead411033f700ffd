use {
    super::cadence::FrameCadence,
    crate::{swapchain::AcquireTimeout, EngineOptions, RenderMode},
    std::time::{Duration, Instant},
};

/// How long immediate mode waits for a swapchain image.
pub const IMMEDIATE_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(1);

/// How often a deprecated swapchain is checked while images are out.
const REBUILD_POLL: Duration = Duration::from_millis(1);

/// The swapchain as the view thread sees it.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SwapchainStatus {
    /// False while there is no swapchain, e.g. the surface is minimized.
    pub available: bool,
    pub deprecated: bool,
    pub acquired_images: u32,
}

/// How to start a frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameStart {
    pub timeout: AcquireTimeout,

    /// Render into an off-screen image which is blitted into the swapchain
    /// image.
    pub offscreen: bool,

    /// Block on a present queue and present as soon as the frame is done.
    pub present_inline: bool,
}

/// What the view thread does next.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ViewAction {
    /// Invalidate pending frames, drop held presents and rebuild the
    /// swapchain.
    Recreate,
    StartFrame(FrameStart),

    /// Sleep until the deadline or the next message.
    Wait(Instant),
}

/// The per-tick scheduling decisions of a view.
#[derive(Debug, Clone)]
pub struct ViewController {
    mode: RenderMode,
    flatten_frame_rate: bool,
    max_frames_in_flight: usize,
    cadence: FrameCadence,
    ready: bool,
    delay_until: Option<Instant>,
}

impl ViewController {
    pub fn new(options: &EngineOptions, max_frames_in_flight: usize) -> Self {
        Self {
            mode: options.render_mode,
            flatten_frame_rate: options.flatten_frame_rate,
            max_frames_in_flight: max_frames_in_flight.max(1),
            cadence: FrameCadence::new(options.update_interval),
            ready: false,
            delay_until: None,
        }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    pub fn cadence(&self) -> &FrameCadence {
        &self.cadence
    }

    /// The scene asked for its next frame.
    pub fn set_ready(&mut self) {
        self.ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn next_action(
        &mut self,
        now: Instant,
        frames_in_progress: usize,
        status: SwapchainStatus,
    ) -> ViewAction {
        if !status.available || status.deprecated {
            if status.acquired_images == 0 {
                return ViewAction::Recreate;
            }
            return ViewAction::Wait(now + REBUILD_POLL);
        }

        if let Some(until) = self.delay_until {
            if now < until {
                return ViewAction::Wait(until);
            }
            self.delay_until = None;
        }

        let deadline = self.cadence.next_deadline(now);
        let due = now >= deadline;
        let has_room = frames_in_progress < self.max_frames_in_flight;
        let start = match self.mode {
            RenderMode::RenderOnDemand => {
                (self.ready && has_room) || (frames_in_progress == 0 && due)
            }
            RenderMode::PresentImmediate => frames_in_progress == 0 && due,
            RenderMode::FollowDisplayLink
            | RenderMode::RenderImageOffscreen => has_room && due,
        };
        if !start {
            return ViewAction::Wait(deadline.max(now + REBUILD_POLL));
        }

        ViewAction::StartFrame(match self.mode {
            RenderMode::PresentImmediate => FrameStart {
                timeout: AcquireTimeout::Timeout(IMMEDIATE_ACQUIRE_TIMEOUT),
                offscreen: false,
                present_inline: true,
            },
            RenderMode::RenderImageOffscreen => FrameStart {
                timeout: AcquireTimeout::Lockfree,
                offscreen: true,
                present_inline: false,
            },
            RenderMode::FollowDisplayLink | RenderMode::RenderOnDemand => {
                FrameStart {
                    timeout: AcquireTimeout::Lockfree,
                    offscreen: false,
                    present_inline: false,
                }
            }
        })
    }

    /// A frame was started at `now`.
    pub fn frame_started(&mut self, now: Instant) {
        self.cadence.frame_started(now);
        self.ready = false;
    }

    /// A frame was presented at `now`. With frame rate flattening on, a
    /// frame which ran over budget delays the next one.
    pub fn frame_presented(&mut self, now: Instant) {
        if !self.flatten_frame_rate {
            return;
        }
        let delay = self.cadence.flatten_delay(now);
        if !delay.is_zero() {
            log::trace!("Delaying the next frame by {:?}", delay);
            self.delay_until = Some(now + delay);
        }
    }

    /// Display link mode holds presents until the next v-sync tick.
    pub fn holds_presents(&self) -> bool {
        self.mode == RenderMode::FollowDisplayLink
    }

    /// The swapchain was rebuilt.
    pub fn swapchain_recreated(&mut self) {
        self.cadence.reset();
        self.delay_until = None;
    }
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq};

    const MS: Duration = Duration::from_millis(1);

    const READY: SwapchainStatus = SwapchainStatus {
        available: true,
        deprecated: false,
        acquired_images: 0,
    };

    fn controller(mode: RenderMode) -> ViewController {
        let options = EngineOptions {
            render_mode: mode,
            update_interval: 10 * MS,
            ..EngineOptions::default()
        };
        ViewController::new(&options, 2)
    }

    fn starts(action: ViewAction) -> bool {
        matches!(action, ViewAction::StartFrame(_))
    }

    #[test]
    fn on_demand_waits_for_ready_or_idle_deadline() {
        let now = Instant::now();
        let mut view = controller(RenderMode::RenderOnDemand);
        assert!(starts(view.next_action(now, 0, READY)));
        view.frame_started(now);

        // in flight and not ready
        assert_eq!(
            view.next_action(now + MS, 1, READY),
            ViewAction::Wait(now + 10 * MS)
        );
        // past the deadline but a frame is still in flight
        assert!(!starts(view.next_action(now + 11 * MS, 1, READY)));

        view.set_ready();
        assert!(starts(view.next_action(now + 2 * MS, 1, READY)));
        view.frame_started(now + 2 * MS);
        assert!(!view.is_ready());

        // idle after the deadline
        assert!(starts(view.next_action(now + 12 * MS, 0, READY)));
    }

    #[test]
    fn immediate_mode_presents_inline_with_a_short_timeout() {
        let now = Instant::now();
        let mut view = controller(RenderMode::PresentImmediate);
        assert_eq!(
            view.next_action(now, 0, READY),
            ViewAction::StartFrame(FrameStart {
                timeout: AcquireTimeout::Timeout(IMMEDIATE_ACQUIRE_TIMEOUT),
                offscreen: false,
                present_inline: true,
            })
        );
        view.frame_started(now);
        assert!(!starts(view.next_action(now + 20 * MS, 1, READY)));
    }

    #[test]
    fn offscreen_and_display_link_fill_the_flight() {
        let now = Instant::now();
        let mut view = controller(RenderMode::RenderImageOffscreen);
        match view.next_action(now, 1, READY) {
            ViewAction::StartFrame(start) => assert!(start.offscreen),
            action => panic!("unexpected {:?}", action),
        }
        assert!(!starts(view.next_action(now, 2, READY)));

        let view = controller(RenderMode::FollowDisplayLink);
        assert!(view.holds_presents());
    }

    #[test]
    fn deprecated_swapchains_rebuild_once_images_return() {
        let now = Instant::now();
        let mut view = controller(RenderMode::RenderOnDemand);
        let mut status = SwapchainStatus {
            available: true,
            deprecated: true,
            acquired_images: 2,
        };
        assert!(matches!(
            view.next_action(now, 2, status),
            ViewAction::Wait(_)
        ));
        status.acquired_images = 0;
        assert_eq!(view.next_action(now, 0, status), ViewAction::Recreate);
    }

    #[test]
    fn rebuild_is_deferred_while_any_image_is_out() {
        let now = Instant::now();
        let mut view = controller(RenderMode::RenderImageOffscreen);
        view.set_ready();
        let mut status = SwapchainStatus {
            available: true,
            deprecated: true,
            acquired_images: 2,
        };

        // no new frame starts on a deprecated swapchain either
        for acquired in [2, 1] {
            status.acquired_images = acquired;
            assert_eq!(
                view.next_action(now + 20 * MS, 0, status),
                ViewAction::Wait(now + 20 * MS + REBUILD_POLL)
            );
        }
        status.acquired_images = 0;
        assert_eq!(
            view.next_action(now + 20 * MS, 0, status),
            ViewAction::Recreate
        );

        // a hidden surface rebuilds under the same rule
        let hidden = SwapchainStatus {
            available: false,
            deprecated: false,
            acquired_images: 1,
        };
        assert!(matches!(
            view.next_action(now, 0, hidden),
            ViewAction::Wait(_)
        ));
    }

    #[test]
    fn flattening_delays_after_an_overshoot() {
        let now = Instant::now();
        let options = EngineOptions {
            render_mode: RenderMode::FollowDisplayLink,
            update_interval: 10 * MS,
            flatten_frame_rate: true,
            ..EngineOptions::default()
        };
        let mut view = ViewController::new(&options, 2);
        view.frame_started(now);
        view.frame_started(now + 10 * MS);

        // 30ms window: 20ms over budget minus the 10ms average
        view.frame_presented(now + 40 * MS);
        assert_eq!(
            view.next_action(now + 41 * MS, 0, READY),
            ViewAction::Wait(now + 50 * MS)
        );
        assert!(starts(view.next_action(now + 50 * MS, 0, READY)));
    }
}
