use {
    super::{
        emitter::FrameEmitter,
        queue::{FrameNode, FrameQueue},
        request::{
            FrameHandle, FrameInfo, FrameOutcome, FrameRequest, QueuePass,
        },
        timer::{TimerId, Timers},
        worker::WorkerPool,
    },
    crate::{
        device::{Device, Fence, FenceDevice},
        memory::{Allocator, DeviceMemoryPool},
        queue::{DeviceQueue, QueueOperations, QueuePool},
        render_pass::{DescriptorPhase, DescriptorSink},
        RenderError,
    },
    anyhow::Context,
    std::{
        any::Any,
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Condvar, Mutex,
        },
        thread::JoinHandle,
        time::{Duration, Instant},
    },
};

/// Work which runs on the loop thread.
pub type LoopTask = Box<dyn FnOnce(&mut LoopContext) + Send>;

/// Where a continuation runs once its worker task finished.
pub enum Then<T> {
    /// On the same worker, right after the task.
    Worker(Box<dyn FnOnce(T) + Send>),

    /// On the loop thread, during its next tick.
    Loop(Box<dyn FnOnce(&mut LoopContext, T) + Send>),

    Nothing,
}

/// Events delivered to the host's callback.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoopEvent {
    /// The update interval elapsed, with the actual time since the last
    /// update.
    Update(Duration),

    /// The device reported a fatal error. `Exit` follows.
    DeviceLost,

    /// The loop stopped.
    Exit,
}

struct Shared {
    tasks: Mutex<TaskQueue>,
    wakeup: Condvar,
    running: Arc<AtomicBool>,
}

#[derive(Default)]
struct TaskQueue {
    tasks: VecDeque<LoopTask>,
    last_order: u64,
}

/// A cheap, cloneable way to reach the loop from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Run `task` on the loop thread during its next tick.
    pub fn perform(
        &self,
        task: impl FnOnce(&mut LoopContext) + Send + 'static,
    ) {
        self.shared
            .tasks
            .lock()
            .unwrap()
            .tasks
            .push_back(Box::new(task));
        self.shared.wakeup.notify_one();
    }

    /// Start a frame. The returned handle can invalidate it from any
    /// thread.
    pub fn run_render_queue(&self, request: FrameRequest) -> FrameHandle {
        let handle = {
            let mut queue = self.shared.tasks.lock().unwrap();
            queue.last_order += 1;
            let handle = FrameHandle::new(queue.last_order, request.generation);
            let frame = handle.clone();
            queue.tasks.push_back(Box::new(move |context: &mut LoopContext| {
                context.start_frame(frame, request)
            }));
            handle
        };
        self.shared.wakeup.notify_one();
        handle
    }

    /// Interrupt the current wait without queueing work.
    pub fn wakeup(&self) {
        self.shared.wakeup.notify_all();
    }

    /// Ask the loop to stop after the current tick.
    pub fn cancel(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wakeup.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.tasks.lock().unwrap().tasks.len()
    }

    fn take_tasks(&self, timeout: Duration) -> Vec<LoopTask> {
        let mut queue = self.shared.tasks.lock().unwrap();
        if queue.tasks.is_empty() && !timeout.is_zero() && self.is_running() {
            queue = self
                .shared
                .wakeup
                .wait_timeout(queue, timeout)
                .unwrap()
                .0;
        }
        queue.tasks.drain(..).collect()
    }
}

/// Everything the loop needs from the rest of the engine.
pub struct LoopInfo {
    pub fence_device: Arc<dyn FenceDevice>,
    pub queues: Arc<QueuePool>,
    pub workers: Arc<WorkerPool>,
    pub descriptor_sink: Arc<dyn DescriptorSink>,

    /// Frames and ticks get memory pools when set.
    pub allocator: Option<Arc<Allocator>>,

    /// Finished frames collect the device's retired objects when set.
    pub device: Option<Arc<Device>>,

    pub update_interval: Duration,
    pub frame_emitter_barrier: bool,
}

type EventFn = Box<dyn FnMut(LoopEvent) + Send>;

/// The state owned by the loop thread. Tasks receive it mutably.
pub struct LoopContext {
    handle: LoopHandle,
    fence_device: Arc<dyn FenceDevice>,
    queues: Arc<QueuePool>,
    workers: Arc<WorkerPool>,
    descriptor_sink: Arc<dyn DescriptorSink>,
    allocator: Option<Arc<Allocator>>,
    device: Option<Arc<Device>>,
    active_fences: Vec<Fence>,
    free_fences: Vec<Fence>,
    timers: Timers,
    autorelease: Vec<Box<dyn Any + Send>>,
    tick_pool: Option<DeviceMemoryPool>,
    emitter: FrameEmitter,
    frames: FrameQueue,
    events: Option<EventFn>,
    update_interval: Duration,
    last_update: Instant,
    fatal: Option<RenderError>,
}

// Public API
// ----------

impl LoopContext {
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn queues(&self) -> &Arc<QueuePool> {
        &self.queues
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// Memory which lives until the end of the current tick.
    pub fn tick_pool(&mut self) -> Option<&mut DeviceMemoryPool> {
        self.tick_pool.as_mut()
    }

    /// Keep `object` alive until the end of the current tick.
    pub fn autorelease(&mut self, object: impl Any + Send) {
        self.autorelease.push(Box::new(object));
    }

    pub fn schedule(
        &mut self,
        callback: impl FnMut(Duration) -> bool + Send + 'static,
    ) -> TimerId {
        self.timers.schedule(callback)
    }

    pub fn schedule_interval(
        &mut self,
        interval: Duration,
        callback: impl FnMut(Duration) -> bool + Send + 'static,
    ) -> TimerId {
        self.timers.schedule_interval(interval, callback)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Take a fence for a submission. Signaled fences are reused.
    pub fn acquire_fence(&mut self) -> Result<Fence, RenderError> {
        match self.free_fences.pop() {
            Some(fence) => Ok(fence),
            None => Ok(Fence::new(self.fence_device.create_fence()?)),
        }
    }

    /// Track an armed fence. Its release callbacks run on the loop thread
    /// once it signals.
    pub fn schedule_fence(&mut self, fence: Fence) {
        self.active_fences.push(fence);
    }

    pub fn active_fences(&self) -> usize {
        self.active_fences.len()
    }

    /// Run `work` on a worker, then `then`.
    pub fn perform_in_queue<T: Send + 'static>(
        &self,
        work: impl FnOnce() -> T + Send + 'static,
        then: Then<T>,
    ) {
        let handle = self.handle.clone();
        self.workers.perform(move || {
            let result = work();
            match then {
                Then::Worker(then) => then(result),
                Then::Loop(then) => {
                    handle.perform(move |context| then(context, result))
                }
                Then::Nothing => (),
            }
        });
    }

    /// Hand a queue to `then` on the loop thread as soon as one is free.
    /// Nothing runs if the loop stops first.
    pub fn acquire_queue(
        &self,
        ops: QueueOperations,
        then: impl FnOnce(&mut LoopContext, DeviceQueue) + Send + 'static,
    ) -> bool {
        let handle = self.handle.clone();
        self.queues.acquire_for_loop(
            ops,
            self.handle.shared.running.clone(),
            move |queue| handle.perform(move |context| then(context, queue)),
            || log::debug!("Loop queue request dropped"),
        )
    }

    /// Frames started and not finished, across every render queue.
    pub fn frames_in_progress(&self) -> usize {
        self.emitter.total_frames_in_progress()
    }

    /// Block until the device and the loop have no work left.
    ///
    /// Pending fences are waited on, then the device idles, then queued
    /// loop and worker work runs until nothing new appears.
    pub fn wait_idle(&mut self) -> Result<(), RenderError> {
        let running = self.handle.shared.running.swap(false, Ordering::AcqRel);
        let result = self.wait_idle_inner();
        self.handle.shared.running.store(running, Ordering::Release);
        result
    }
}

// Private API
// -----------

impl LoopContext {
    fn emit(&mut self, event: LoopEvent) {
        if let Some(events) = &mut self.events {
            events(event);
        }
    }

    fn poll_timeout(&self) -> Duration {
        let mut timeout = self.update_interval.min(Duration::from_secs(1) / 60);
        if let Some(deadline) = self.timers.next_deadline() {
            timeout = timeout.min(deadline);
        }
        let since_update = self.last_update.elapsed();
        let until_update = self.update_interval.saturating_sub(since_update);
        timeout.min(until_update)
    }

    /// Run release callbacks of signaled fences and recycle them.
    fn poll_fences(&mut self, wait: bool) -> Result<(), RenderError> {
        let mut index = 0;
        let mut result = Ok(());
        while index < self.active_fences.len() {
            let status =
                self.active_fences[index].check(&*self.fence_device, wait);
            match status {
                Ok(false) => index += 1,
                Ok(true) => {
                    let fence = self.active_fences.remove(index);
                    self.recycle_fence(fence);
                }
                Err(err) => {
                    let fence = self.active_fences.remove(index);
                    unsafe { self.fence_device.destroy_fence(fence.raw()) };
                    if err.is_fatal() {
                        return Err(err);
                    }
                    result = Err(err);
                }
            }
        }
        result
    }

    fn recycle_fence(&mut self, mut fence: Fence) {
        match fence.reset(&*self.fence_device) {
            Ok(()) => self.free_fences.push(fence),
            Err(err) => {
                log::warn!("Unable to reset fence {:?}: {}", fence.raw(), err);
                unsafe { self.fence_device.destroy_fence(fence.raw()) };
            }
        }
    }

    fn wait_idle_inner(&mut self) -> Result<(), RenderError> {
        self.poll_fences(true)?;
        self.fence_device.device_wait_idle()?;
        loop {
            self.workers.wait_idle();
            let tasks = self.handle.take_tasks(Duration::ZERO);
            if tasks.is_empty() && self.active_fences.is_empty() {
                return Ok(());
            }
            for task in tasks {
                task(self);
            }
            self.poll_fences(true)?;
        }
    }

    /// Release every fence without waiting. Callbacks see a failure.
    fn abandon_fences(&mut self) {
        for mut fence in self.active_fences.drain(..) {
            fence.cancel();
            unsafe { self.fence_device.destroy_fence(fence.raw()) };
        }
    }

    fn destroy_fences(&mut self) {
        for fence in self.free_fences.drain(..) {
            unsafe { self.fence_device.destroy_fence(fence.raw()) };
        }
    }

    fn start_frame(&mut self, handle: FrameHandle, request: FrameRequest) {
        let order = handle.order();
        let pool = self.allocator.as_ref().map(|allocator| {
            Arc::new(Mutex::new(DeviceMemoryPool::new(allocator.clone())))
        });
        if let Some(device) = &self.device {
            device.set_latest_frame_order(order);
        }
        log::trace!(
            "Frame {} (generation {}) on '{}'",
            order,
            handle.generation(),
            request.queue.name()
        );
        self.emitter.frame_started(request.queue.id());
        self.frames.insert(FrameNode {
            handle,
            queue: request.queue,
            inputs: Arc::new(request.inputs),
            pool,
            outputs: request.outputs,
            submitted: request.submitted,
            complete: request.complete,
            next_pass: 0,
            pending_fences: 0,
            refs: 0,
            outcome: None,
        });
        self.schedule_next_pass(order);
    }

    fn schedule_next_pass(&mut self, order: u64) {
        let Some(node) = self.frames.get_mut(order) else {
            return;
        };
        if node.is_finished() {
            return;
        }
        if !node.handle.is_valid() {
            if node.pending_fences == 0 {
                self.finish_frame(order, FrameOutcome::Invalidated);
            }
            return;
        }
        let passes = node.queue.passes();
        if node.next_pass >= passes.len() {
            if node.pending_fences == 0 {
                self.finish_frame(order, FrameOutcome::Complete);
            }
            return;
        }
        let pass = passes[node.next_pass].clone();
        node.next_pass += 1;
        let info = node.handle.info(
            &pass.name,
            node.inputs.clone(),
            node.pool.clone(),
        );
        let valid = node.handle.valid_flag();
        self.frames.retain(order);

        let ops = pass.ops;
        let skipped = (pass.clone(), info.clone());
        let acquired = self.handle.clone();
        let invalidated = self.handle.clone();
        let queued = self.queues.acquire_for_frame(
            ops,
            order,
            valid,
            move |queue| {
                acquired.perform(move |context| {
                    context.prepare_pass(order, pass, info, queue)
                })
            },
            move || {
                invalidated.perform(move |context| {
                    let (pass, info) = skipped;
                    pass.executor.invalidate(&info);
                    context.frames.release(order);
                    context.finish_frame(order, FrameOutcome::Invalidated);
                })
            },
        );
        if !queued {
            log::error!("No queue family supports {:?}", ops);
            self.frames.release(order);
            self.finish_frame(order, FrameOutcome::Failed);
        }
    }

    /// Loop thread: synchronous descriptor writes and pass preparation.
    fn prepare_pass(
        &mut self,
        order: u64,
        pass: QueuePass,
        info: FrameInfo,
        queue: DeviceQueue,
    ) {
        if !info.is_valid() {
            let outcome = FrameOutcome::Invalidated;
            self.abort_pass(order, &pass, &info, queue, outcome);
            return;
        }
        unsafe {
            pass.descriptors
                .write(DescriptorPhase::Sync, &*self.descriptor_sink)
        };
        if let Err(err) = pass.executor.prepare(&info) {
            log::error!("Pass '{}' failed to prepare: {}", pass.name, err);
            self.abort_pass(order, &pass, &info, queue, FrameOutcome::Failed);
            return;
        }

        let sink = self.descriptor_sink.clone();
        self.perform_in_queue(
            move || {
                // update-after-bind sets may change while recording
                unsafe {
                    pass.descriptors.write(DescriptorPhase::Async, &*sink)
                };
                let recorded = pass.executor.record(&info);
                (pass, info, recorded)
            },
            Then::Loop(Box::new(
                move |context: &mut LoopContext,
                      (pass, info, recorded): (
                    QueuePass,
                    FrameInfo,
                    Result<(), RenderError>,
                )| {
                    context.submit_recorded(order, pass, info, queue, recorded)
                },
            )),
        );
    }

    /// Loop thread: wait for the frame emitter, then submit.
    fn submit_recorded(
        &mut self,
        order: u64,
        pass: QueuePass,
        info: FrameInfo,
        queue: DeviceQueue,
        recorded: Result<(), RenderError>,
    ) {
        if let Err(err) = recorded {
            log::error!("Pass '{}' failed to record: {}", pass.name, err);
            self.abort_pass(order, &pass, &info, queue, FrameOutcome::Failed);
            return;
        }
        let Some(node) = self.frames.get_mut(order) else {
            self.queues.release_queue(queue);
            return;
        };
        let queue_id = node.queue.id();
        let async_pass = pass.async_pass;
        let task: LoopTask = Box::new(move |context: &mut LoopContext| {
            context.submit_pass(order, queue_id, pass, info, queue)
        });
        let task = self.emitter.request_submit(queue_id, async_pass, task);
        if let Some(task) = task {
            task(self);
        }
    }

    fn submit_pass(
        &mut self,
        order: u64,
        queue_id: u64,
        pass: QueuePass,
        info: FrameInfo,
        queue: DeviceQueue,
    ) {
        let holds_barrier = !pass.async_pass && self.emitter.has_barrier();
        if !info.is_valid() {
            self.release_barrier(queue_id, holds_barrier);
            let outcome = FrameOutcome::Invalidated;
            self.abort_pass(order, &pass, &info, queue, outcome);
            return;
        }
        let mut fence = match self.acquire_fence() {
            Ok(fence) => fence,
            Err(err) => {
                log::error!("No fence for pass '{}': {}", pass.name, err);
                self.release_barrier(queue_id, holds_barrier);
                let outcome = FrameOutcome::Failed;
                self.abort_pass(order, &pass, &info, queue, outcome);
                self.note_error(err);
                return;
            }
        };

        let submitted = pass.executor.submit(&info, &queue, fence.raw());
        if let Err(err) = submitted {
            log::error!("Pass '{}' failed to submit: {}", pass.name, err);
            self.free_fences.push(fence);
            self.release_barrier(queue_id, holds_barrier);
            self.abort_pass(order, &pass, &info, queue, FrameOutcome::Failed);
            self.note_error(err);
            return;
        }

        queue.retain_fence();
        let counter = queue.fence_counter();
        self.queues.release_queue(queue);

        fence.arm();
        let handle = self.handle.clone();
        let added = fence.add_release(pass.name.clone(), move |success| {
            let _ = counter.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |count| count.checked_sub(1),
            );
            handle.perform(move |context| {
                context.pass_complete(order, queue_id, holds_barrier, success)
            });
        });
        if let Err(err) = added {
            log::error!("Unable to track pass '{}': {}", pass.name, err);
        }
        self.schedule_fence(fence);

        if let Some(node) = self.frames.get_mut(order) {
            node.pending_fences += 1;
            if node.next_pass >= node.queue.passes().len() {
                if let Some(submitted) = node.submitted.take() {
                    log::trace!("Frame {} submitted", order);
                    submitted(order);
                }
            }
        }
        self.schedule_next_pass(order);
    }

    fn pass_complete(
        &mut self,
        order: u64,
        queue_id: u64,
        holds_barrier: bool,
        success: bool,
    ) {
        self.release_barrier(queue_id, holds_barrier);
        self.frames.release(order);
        let Some(node) = self.frames.get_mut(order) else {
            return;
        };
        node.pending_fences = node.pending_fences.saturating_sub(1);
        if !success {
            self.finish_frame(order, FrameOutcome::Failed);
            return;
        }
        self.schedule_next_pass(order);
    }

    fn release_barrier(&mut self, queue_id: u64, holds_barrier: bool) {
        if !holds_barrier {
            return;
        }
        if let Some(task) = self.emitter.submission_complete(queue_id) {
            task(self);
        }
    }

    fn abort_pass(
        &mut self,
        order: u64,
        pass: &QueuePass,
        info: &FrameInfo,
        queue: DeviceQueue,
        outcome: FrameOutcome,
    ) {
        self.queues.release_queue(queue);
        pass.executor.invalidate(info);
        self.frames.release(order);
        self.finish_frame(order, outcome);
    }

    fn note_error(&mut self, err: RenderError) {
        if err.is_fatal() && self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    fn finish_frame(&mut self, order: u64, outcome: FrameOutcome) {
        let Some(node) = self.frames.get_mut(order) else {
            return;
        };
        if node.is_finished() {
            return;
        }
        node.outcome = Some(outcome);
        let outputs = std::mem::take(&mut node.outputs);
        let complete = node.complete.take();
        let queue_id = node.queue.id();
        let info = node.handle.info("", node.inputs.clone(), node.pool.take());

        log::trace!("Frame {} finished: {:?}", order, outcome);
        if outcome == FrameOutcome::Complete {
            for (attachment, output) in outputs {
                log::trace!("Frame {} output '{}'", order, attachment);
                output(&info);
            }
        }
        if let Some(complete) = complete {
            complete(order, outcome);
        }
        self.emitter.frame_finished(queue_id);

        if let Some(device) = &self.device {
            device.collect_garbage(self.frames.completed_watermark());
        }
    }
}

/// The frame scheduler. Owns the loop thread's state and drives it one tick
/// at a time.
pub struct Loop {
    context: LoopContext,
}

impl Loop {
    pub fn new(info: LoopInfo) -> Self {
        let handle = LoopHandle {
            shared: Arc::new(Shared {
                tasks: Mutex::new(TaskQueue::default()),
                wakeup: Condvar::new(),
                running: Arc::new(AtomicBool::new(true)),
            }),
        };
        let tick_pool = info
            .allocator
            .as_ref()
            .map(|allocator| DeviceMemoryPool::new(allocator.clone()));
        Self {
            context: LoopContext {
                handle,
                fence_device: info.fence_device,
                queues: info.queues,
                workers: info.workers,
                descriptor_sink: info.descriptor_sink,
                allocator: info.allocator,
                device: info.device,
                active_fences: Vec::new(),
                free_fences: Vec::new(),
                timers: Timers::default(),
                autorelease: Vec::new(),
                tick_pool,
                emitter: FrameEmitter::new(info.frame_emitter_barrier),
                frames: FrameQueue::default(),
                events: None,
                update_interval: info.update_interval,
                last_update: Instant::now(),
                fatal: None,
            },
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.context.handle.clone()
    }

    pub fn context(&mut self) -> &mut LoopContext {
        &mut self.context
    }

    /// Deliver loop events to `events`, on the loop thread.
    pub fn on_event(&mut self, events: impl FnMut(LoopEvent) + Send + 'static) {
        self.context.events = Some(Box::new(events));
    }

    /// Run one iteration: queued tasks, fences, timers, then per-tick
    /// cleanup. Returns the number of tasks which ran.
    pub fn tick(&mut self) -> Result<usize, RenderError> {
        let context = &mut self.context;

        let tasks = context.handle.take_tasks(context.poll_timeout());
        let task_count = tasks.len();
        for task in tasks {
            task(context);
        }

        if let Err(err) = context.poll_fences(false) {
            if err.is_fatal() {
                return Err(err);
            }
            log::warn!("Fence check failed: {}", err);
        }

        let delta = context.last_update.elapsed();
        if delta >= context.update_interval {
            context.last_update = Instant::now();
            context.timers.advance(delta);
            context.emit(LoopEvent::Update(delta));
        }

        context.autorelease.clear();
        if let Some(pool) = &mut context.tick_pool {
            pool.reset();
        }
        context.frames.collect();

        match context.fatal.take() {
            Some(err) => Err(err),
            None => Ok(task_count),
        }
    }

    /// Tick until cancelled or until the device is lost.
    pub fn run(mut self) {
        log::debug!("Loop started");
        let mut device_lost = false;
        while self.context.handle.is_running() {
            match self.tick() {
                Ok(_) => (),
                Err(err) if err.is_fatal() => {
                    log::error!("Loop stopping: {}", err);
                    device_lost = true;
                    break;
                }
                Err(err) => log::error!("Loop tick failed: {}", err),
            }
        }
        self.shutdown(device_lost);
    }

    /// Run the loop on its own thread.
    pub fn spawn(self, name: &str) -> Result<JoinHandle<()>, RenderError> {
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || self.run())
            .context("Unable to spawn the loop thread")?;
        Ok(thread)
    }

    fn shutdown(&mut self, device_lost: bool) {
        let context = &mut self.context;
        context.handle.shared.running.store(false, Ordering::Release);
        if device_lost {
            context.emit(LoopEvent::DeviceLost);
            context.abandon_fences();
        } else if let Err(err) = context.wait_idle_inner() {
            log::error!("Unable to idle while stopping: {}", err);
            context.abandon_fences();
        }
        context.queues.invalidate_waiters();
        for frame in context.frames.unfinished() {
            context.finish_frame(frame, FrameOutcome::Invalidated);
        }
        drop(context.emitter.drain());
        context.destroy_fences();
        context.emit(LoopEvent::Exit);
        log::debug!("Loop stopped");
    }
}
