//! Views own a surface and drive its frames from a dedicated thread.
//!
//! Each tick the [ViewController] decides whether to rebuild the swapchain,
//! start a frame, or sleep. Frames report back through the [ViewHandle]
//! once their last pass is queued, and the view presents them behind the
//! frame's signal semaphore, either right away or on the next display link
//! tick. A frame keeps its flight slot until its fences signal.

mod cadence;
mod controller;
mod target;

use {
    crate::{frame::FrameOutcome, EngineOptions, RenderError, RenderMode},
    anyhow::Context,
    std::{
        collections::{HashSet, VecDeque},
        sync::{
            mpsc::{channel, Receiver, RecvTimeoutError, Sender},
            Arc, Mutex,
        },
        thread::JoinHandle,
        time::{Duration, Instant},
    },
};

pub use self::{
    cadence::{FrameCadence, CADENCE_WINDOW},
    controller::{
        FrameStart, SwapchainStatus, ViewAction, ViewController,
        IMMEDIATE_ACQUIRE_TIMEOUT,
    },
    target::{FrameBuilder, SwapchainFrame, SwapchainTarget},
};

/// What a view renders into.
///
/// Every method runs on the view thread.
pub trait ViewTarget: Send + 'static {
    fn status(&self) -> SwapchainStatus;

    /// Acquire an image and start a frame for it.
    ///
    /// Returns the frame order, or `None` when no image was ready.
    fn start_frame(
        &mut self,
        start: FrameStart,
        view: &ViewHandle,
    ) -> Result<Option<u64>, RenderError>;

    /// Present a frame whose last pass has been queued.
    ///
    /// Returns false when no queue was available and the present should be
    /// retried.
    fn present(&mut self, order: u64, inline: bool)
        -> Result<bool, RenderError>;

    /// Drop a frame which will not be presented.
    fn discard(&mut self, order: u64);

    /// Invalidate every frame which still holds a swapchain image.
    fn invalidate_frames(&mut self);

    /// Mark the swapchain stale.
    fn deprecate(&mut self, fast: bool);

    fn recreate(&mut self) -> Result<(), RenderError>;
}

#[derive(Debug)]
enum ViewMessage {
    Ready,
    DisplayLink,
    Deprecate { fast: bool },
    FrameSubmitted { order: u64 },
    FrameComplete { order: u64, outcome: FrameOutcome },
    Close,
}

/// Counters a view publishes.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct ViewStats {
    pub frames_presented: u64,
    pub average_frame_interval: Duration,
    pub frames_in_progress: usize,
    pub swapchains_created: u64,
}

/// A cloneable way to talk to a view thread.
#[derive(Clone)]
pub struct ViewHandle {
    sender: Sender<ViewMessage>,
    stats: Arc<Mutex<ViewStats>>,
}

impl ViewHandle {
    /// The scene has its next frame ready.
    pub fn set_ready_for_next_frame(&self) {
        self.send(ViewMessage::Ready);
    }

    /// An external v-sync tick arrived.
    pub fn display_link(&self) {
        self.send(ViewMessage::DisplayLink);
    }

    /// Mark the swapchain stale, e.g. after a resize. A fast deprecation
    /// rebuilds with the fast present mode.
    pub fn deprecate(&self, fast: bool) {
        self.send(ViewMessage::Deprecate { fast });
    }

    /// Called by frames once their last pass is queued.
    pub fn frame_submitted(&self, order: u64) {
        self.send(ViewMessage::FrameSubmitted { order });
    }

    /// Called by frames when they end.
    pub fn frame_complete(&self, order: u64, outcome: FrameOutcome) {
        self.send(ViewMessage::FrameComplete { order, outcome });
    }

    pub fn close(&self) {
        self.send(ViewMessage::Close);
    }

    pub fn stats(&self) -> ViewStats {
        *self.stats.lock().unwrap()
    }

    fn send(&self, message: ViewMessage) {
        if self.sender.send(message).is_err() {
            log::trace!("View thread is gone");
        }
    }
}

/// A running view thread.
pub struct View {
    handle: ViewHandle,
    thread: Option<JoinHandle<()>>,
}

impl View {
    /// Start the view thread for `target`.
    ///
    /// # Params
    ///
    /// * `name` - the thread name
    /// * `target` - the swapchain, or anything standing in for one
    /// * `options` - render mode and cadence
    /// * `max_frames_in_flight` - frames started and not yet both presented
    ///   and complete
    pub fn spawn(
        name: &str,
        target: impl ViewTarget,
        options: &EngineOptions,
        max_frames_in_flight: usize,
    ) -> Result<Self, RenderError> {
        let (sender, receiver) = channel();
        let handle = ViewHandle {
            sender,
            stats: Arc::new(Mutex::new(ViewStats::default())),
        };
        let mut view_loop = ViewLoop {
            controller: ViewController::new(options, max_frames_in_flight),
            target: Box::new(target),
            handle: handle.clone(),
            receiver,
            in_flight: HashSet::new(),
            submitted: HashSet::new(),
            held: VecDeque::new(),
            deprecate_on_tick: None,
            running: true,
        };
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || view_loop.run())
            .with_context(|| format!("Unable to spawn view thread {}", name))?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ViewHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> ViewStats {
        self.handle.stats()
    }

    /// Stop the thread and wait for it.
    pub fn close(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("View thread panicked");
            }
        }
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.join();
    }
}

// Private API
// -----------

struct ViewLoop {
    controller: ViewController,
    target: Box<dyn ViewTarget>,
    handle: ViewHandle,
    receiver: Receiver<ViewMessage>,

    /// Frames started and not yet complete.
    in_flight: HashSet<u64>,

    /// Frames in flight whose last pass was queued.
    submitted: HashSet<u64>,

    /// Submitted frames waiting for their present.
    held: VecDeque<u64>,

    deprecate_on_tick: Option<bool>,
    running: bool,
}

impl ViewLoop {
    fn run(&mut self) {
        log::debug!("View thread started");
        while self.running {
            if let Err(err) = self.tick() {
                if err.is_fatal() {
                    log::error!("View stopped: {}", err);
                    break;
                }
                log::warn!("View tick failed: {}", err);
                let retry = Instant::now() + Duration::from_millis(10);
                if let Err(err) = self.wait_until(retry) {
                    log::warn!("{}", err);
                }
            }
        }
        for order in self.held.drain(..) {
            self.target.discard(order);
        }
        self.target.invalidate_frames();
        log::debug!("View thread stopped");
    }

    fn tick(&mut self) -> Result<(), RenderError> {
        if !self.held.is_empty() && !self.controller.holds_presents() {
            self.present_held()?;
        }
        let now = Instant::now();
        let action = self.controller.next_action(
            now,
            self.frames_in_progress(),
            self.target.status(),
        );
        match action {
            ViewAction::Recreate => {
                for order in self.held.drain(..) {
                    self.target.discard(order);
                }
                self.target.invalidate_frames();
                self.target.recreate()?;
                self.controller.swapchain_recreated();
                if self.target.status().available {
                    self.stats().swapchains_created += 1;
                } else {
                    // minimized surfaces are polled
                    let retry = Instant::now() + Duration::from_millis(10);
                    self.wait_until(retry)?;
                }
            }
            ViewAction::StartFrame(start) => {
                match self.target.start_frame(start, &self.handle) {
                    Ok(Some(order)) => {
                        self.in_flight.insert(order);
                        self.controller.frame_started(now);
                    }
                    Ok(None) => {
                        self.wait_until(now + Duration::from_millis(1))?;
                    }
                    Err(RenderError::SwapchainOutOfDate) => {
                        log::debug!("Swapchain out of date on acquire");
                    }
                    Err(err) => return Err(err),
                }
                self.drain_messages()?;
            }
            ViewAction::Wait(deadline) => self.wait_until(deadline)?,
        }
        self.publish_stats();
        Ok(())
    }

    /// Handle messages until `deadline` or until one arrives.
    fn wait_until(&mut self, deadline: Instant) -> Result<(), RenderError> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => self.handle_message(message)?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => self.running = false,
        }
        self.drain_messages()
    }

    fn drain_messages(&mut self) -> Result<(), RenderError> {
        while let Ok(message) = self.receiver.try_recv() {
            self.handle_message(message)?;
        }
        if let Some(fast) = self.deprecate_on_tick.take() {
            self.target.deprecate(fast);
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        message: ViewMessage,
    ) -> Result<(), RenderError> {
        match message {
            ViewMessage::Ready => self.controller.set_ready(),
            ViewMessage::DisplayLink => self.present_held()?,
            ViewMessage::Deprecate { fast } => {
                self.deprecate_on_tick =
                    Some(fast || self.deprecate_on_tick.unwrap_or(false));
            }
            ViewMessage::FrameSubmitted { order } => {
                if self.in_flight.contains(&order)
                    && self.submitted.insert(order)
                {
                    self.hold(order)?;
                }
            }
            ViewMessage::FrameComplete { order, outcome } => {
                if !self.in_flight.remove(&order) {
                    return Ok(());
                }
                let was_submitted = self.submitted.remove(&order);
                if outcome == FrameOutcome::Complete {
                    if !was_submitted {
                        // a queue without passes never submits
                        self.hold(order)?;
                    }
                    return Ok(());
                }
                log::debug!("Frame {} ended {:?}", order, outcome);
                let held = self.held.iter().position(|held| *held == order);
                match held {
                    Some(position) => {
                        self.held.remove(position);
                        self.target.discard(order);
                    }
                    None if !was_submitted => self.target.discard(order),
                    None => {}
                }
            }
            ViewMessage::Close => self.running = false,
        }
        Ok(())
    }

    fn hold(&mut self, order: u64) -> Result<(), RenderError> {
        self.held.push_back(order);
        if !self.controller.holds_presents() {
            self.present_held()?;
        }
        Ok(())
    }

    /// Frames which hold a flight slot: in flight, or complete and still
    /// waiting for their present.
    fn frames_in_progress(&self) -> usize {
        let complete_and_held = self
            .held
            .iter()
            .filter(|order| !self.in_flight.contains(order))
            .count();
        self.in_flight.len() + complete_and_held
    }

    fn present_held(&mut self) -> Result<(), RenderError> {
        let inline = self.controller.mode() == RenderMode::PresentImmediate;
        while let Some(order) = self.held.pop_front() {
            match self.target.present(order, inline) {
                Ok(true) => {
                    self.controller.frame_presented(Instant::now());
                    self.stats().frames_presented += 1;
                }
                Ok(false) => {
                    self.held.push_front(order);
                    break;
                }
                Err(RenderError::SwapchainOutOfDate) => {
                    log::debug!("Swapchain out of date on present");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, ViewStats> {
        self.handle.stats.lock().unwrap()
    }

    fn publish_stats(&self) {
        let average = self.controller.cadence().average();
        let in_progress = self.frames_in_progress();
        let mut stats = self.stats();
        stats.average_frame_interval = average;
        stats.frames_in_progress = in_progress;
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        pretty_assertions::assert_eq,
        std::sync::atomic::{AtomicBool, AtomicU64, Ordering},
    };

    #[derive(Default)]
    struct Counters {
        started: AtomicU64,
        presented: AtomicU64,
        discarded: AtomicU64,
        recreated: AtomicU64,
        deprecated: AtomicBool,

        /// Submitted frames whose fences have not signaled.
        running: Mutex<Vec<u64>>,
    }

    /// Frames submit as soon as they start. With `complete_on_submit`
    /// unset they stay in flight until the test completes them.
    struct FakeTarget {
        counters: Arc<Counters>,
        next_order: u64,
        acquired: u32,
        complete_on_submit: bool,
    }

    impl ViewTarget for FakeTarget {
        fn status(&self) -> SwapchainStatus {
            SwapchainStatus {
                available: self.counters.recreated.load(Ordering::Acquire) > 0,
                deprecated: self.counters.deprecated.load(Ordering::Acquire),
                acquired_images: self.acquired,
            }
        }

        fn start_frame(
            &mut self,
            _start: FrameStart,
            view: &ViewHandle,
        ) -> Result<Option<u64>, RenderError> {
            self.next_order += 1;
            self.acquired += 1;
            view.frame_submitted(self.next_order);
            if self.complete_on_submit {
                view.frame_complete(self.next_order, FrameOutcome::Complete);
            } else {
                self.counters.running.lock().unwrap().push(self.next_order);
            }
            self.counters.started.fetch_add(1, Ordering::AcqRel);
            Ok(Some(self.next_order))
        }

        fn present(
            &mut self,
            _order: u64,
            _inline: bool,
        ) -> Result<bool, RenderError> {
            self.acquired -= 1;
            self.counters.presented.fetch_add(1, Ordering::AcqRel);
            Ok(true)
        }

        fn discard(&mut self, _order: u64) {
            self.acquired -= 1;
            self.counters.discarded.fetch_add(1, Ordering::AcqRel);
        }

        fn invalidate_frames(&mut self) {}

        fn deprecate(&mut self, _fast: bool) {
            self.counters.deprecated.store(true, Ordering::Release);
        }

        fn recreate(&mut self) -> Result<(), RenderError> {
            self.counters.deprecated.store(false, Ordering::Release);
            self.counters.recreated.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn spawn(mode: RenderMode) -> (View, Arc<Counters>) {
        spawn_target(mode, true)
    }

    fn spawn_target(
        mode: RenderMode,
        complete_on_submit: bool,
    ) -> (View, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let target = FakeTarget {
            counters: counters.clone(),
            next_order: 0,
            acquired: 0,
            complete_on_submit,
        };
        let options = EngineOptions {
            render_mode: mode,
            update_interval: Duration::from_millis(2),
            ..EngineOptions::default()
        };
        let view = View::spawn("test-view", target, &options, 2).unwrap();
        (view, counters)
    }

    #[test]
    fn frames_are_presented_when_complete() {
        let (view, counters) = spawn(RenderMode::RenderOnDemand);
        assert!(wait_for(|| counters.presented.load(Ordering::Acquire) >= 3));
        assert!(wait_for(|| view.stats().frames_presented >= 3));
        assert_eq!(view.stats().swapchains_created, 1);
        view.close();
    }

    #[test]
    fn frames_present_before_their_fences_signal() {
        let (view, counters) =
            spawn_target(RenderMode::RenderImageOffscreen, false);
        assert!(wait_for(|| counters.presented.load(Ordering::Acquire) >= 2));
        std::thread::sleep(Duration::from_millis(20));

        // presented but not complete, so both still hold a flight slot
        assert_eq!(counters.started.load(Ordering::Acquire), 2);
        assert_eq!(counters.presented.load(Ordering::Acquire), 2);
        assert!(wait_for(|| view.stats().frames_in_progress == 2));

        let running = std::mem::take(&mut *counters.running.lock().unwrap());
        for order in running {
            view.handle().frame_complete(order, FrameOutcome::Complete);
        }
        assert!(wait_for(|| counters.started.load(Ordering::Acquire) >= 3));
        assert_eq!(counters.discarded.load(Ordering::Acquire), 0);
        view.close();
    }

    #[test]
    fn failed_frames_after_present_are_not_discarded() {
        let (view, counters) =
            spawn_target(RenderMode::RenderImageOffscreen, false);
        assert!(wait_for(|| counters.presented.load(Ordering::Acquire) >= 2));

        let running = std::mem::take(&mut *counters.running.lock().unwrap());
        for order in running {
            view.handle().frame_complete(order, FrameOutcome::Failed);
        }
        assert!(wait_for(|| counters.started.load(Ordering::Acquire) >= 3));
        assert_eq!(counters.discarded.load(Ordering::Acquire), 0);
        view.close();
    }

    #[test]
    fn recreation_waits_for_held_images() {
        let (view, counters) = spawn(RenderMode::FollowDisplayLink);
        assert!(wait_for(|| counters.started.load(Ordering::Acquire) >= 2));
        view.handle().deprecate(false);
        std::thread::sleep(Duration::from_millis(20));

        // both images are still out waiting for the display link
        assert_eq!(counters.recreated.load(Ordering::Acquire), 1);
        assert!(counters.deprecated.load(Ordering::Acquire));

        view.handle().display_link();
        assert!(wait_for(|| counters.recreated.load(Ordering::Acquire) >= 2));
        assert_eq!(counters.presented.load(Ordering::Acquire), 2);
        assert_eq!(counters.discarded.load(Ordering::Acquire), 0);
        view.close();
    }

    #[test]
    fn display_link_holds_presents() {
        let (view, counters) = spawn(RenderMode::FollowDisplayLink);
        assert!(wait_for(|| counters.started.load(Ordering::Acquire) >= 2));
        std::thread::sleep(Duration::from_millis(20));

        // both frames in flight are held
        assert_eq!(counters.presented.load(Ordering::Acquire), 0);
        assert_eq!(counters.started.load(Ordering::Acquire), 2);

        view.handle().display_link();
        assert!(wait_for(|| counters.presented.load(Ordering::Acquire) >= 2));
        view.close();
    }

    #[test]
    fn deprecation_rebuilds_the_swapchain() {
        let (view, counters) = spawn(RenderMode::RenderOnDemand);
        assert!(wait_for(|| counters.presented.load(Ordering::Acquire) >= 1));
        view.handle().deprecate(true);
        assert!(wait_for(|| counters.recreated.load(Ordering::Acquire) >= 2));
        assert!(wait_for(|| view.stats().swapchains_created >= 2));
        view.close();
    }

    #[test]
    fn closing_discards_held_frames() {
        let (view, counters) = spawn(RenderMode::FollowDisplayLink);
        assert!(wait_for(|| counters.started.load(Ordering::Acquire) >= 2));
        view.close();
        assert_eq!(counters.discarded.load(Ordering::Acquire), 2);
    }
}
