//! Frames running through the loop against fake fences and queues.

use {
    anyhow::Result,
    assert2::check,
    ash::vk::{self, Handle},
    ccthw_render_core::{
        device::FakeFenceDevice,
        frame::{
            FrameInfo, FrameOutcome, FrameRequest, Loop, PassExecutor,
            QueuePass, RenderQueue,
        },
        queue::{DeviceQueue, QueueOperations},
        render_pass::{
            BoundDescriptor, DescriptorBinding, DescriptorInfo,
            DescriptorWriter,
        },
        RenderError,
    },
    std::{
        collections::HashSet,
        sync::{Arc, Mutex},
        thread::ThreadId,
        time::{Duration, Instant},
    },
};

mod common;

/// Remembers every submission and which frames the test let finish.
#[derive(Default)]
struct SubmitLog {
    submits: Mutex<Vec<(u64, vk::Fence)>>,
    finished: Mutex<HashSet<u64>>,
    early_submits: Mutex<Vec<u64>>,
    recorded_on: Mutex<Vec<(u64, ThreadId)>>,
    enforce_order: bool,
}

impl SubmitLog {
    fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }

    fn fence_of(&self, order: u64) -> Option<vk::Fence> {
        self.submits
            .lock()
            .unwrap()
            .iter()
            .find(|(submitted, _)| *submitted == order)
            .map(|(_, fence)| *fence)
    }
}

impl PassExecutor for SubmitLog {
    fn record(&self, frame: &FrameInfo) -> Result<(), RenderError> {
        self.recorded_on
            .lock()
            .unwrap()
            .push((frame.order, std::thread::current().id()));
        Ok(())
    }

    fn submit(
        &self,
        frame: &FrameInfo,
        _queue: &DeviceQueue,
        fence: vk::Fence,
    ) -> Result<(), RenderError> {
        let previous_done = frame.order == 1
            || self.finished.lock().unwrap().contains(&(frame.order - 1));
        if self.enforce_order && !previous_done {
            self.early_submits.lock().unwrap().push(frame.order);
        }
        self.submits.lock().unwrap().push((frame.order, fence));
        Ok(())
    }
}

fn tick_until(
    event_loop: &mut Loop,
    mut done: impl FnMut() -> bool,
) -> Result<bool> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        event_loop.tick()?;
        if done() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn tick_for(event_loop: &mut Loop, duration: Duration) -> Result<()> {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        event_loop.tick()?;
    }
    Ok(())
}

type Outcomes = Arc<Mutex<Vec<(u64, FrameOutcome)>>>;

fn start_frames(
    event_loop: &Loop,
    queue: &Arc<RenderQueue>,
    count: usize,
) -> Outcomes {
    let outcomes: Outcomes = Arc::default();
    let handle = event_loop.handle();
    for _ in 0..count {
        let outcomes = outcomes.clone();
        handle.run_render_queue(
            FrameRequest::new(queue.clone(), 1).on_complete(
                move |order, outcome| {
                    outcomes.lock().unwrap().push((order, outcome))
                },
            ),
        );
    }
    outcomes
}

#[test]
pub fn barrier_waits_for_the_previous_fence() -> Result<()> {
    common::setup_logger();
    let fences = Arc::new(FakeFenceDevice::default());
    let sink = Arc::new(common::RecordingSink::default());
    let mut event_loop = common::fake_loop(fences.clone(), sink, true);

    let log = Arc::new(SubmitLog {
        enforce_order: true,
        ..SubmitLog::default()
    });
    let queue = Arc::new(RenderQueue::new(
        "main",
        vec![QueuePass::new("solid", QueueOperations::GRAPHICS, log.clone())],
    )?);
    let outcomes = start_frames(&event_loop, &queue, 3);

    for order in 1..=3 {
        check!(tick_until(&mut event_loop, || log.submit_count()
            == order as usize)?);

        // nothing else goes out while this frame's fence is pending
        tick_for(&mut event_loop, Duration::from_millis(20))?;
        check!(log.submit_count() == order as usize);

        let fence = log.fence_of(order).ok_or_else(|| {
            anyhow::anyhow!("Frame {} was never submitted", order)
        })?;
        log.finished.lock().unwrap().insert(order);
        fences.signal(fence);
        check!(tick_until(&mut event_loop, || {
            outcomes.lock().unwrap().len() == order as usize
        })?);
    }

    check!(log.early_submits.lock().unwrap().is_empty());
    check!(
        *outcomes.lock().unwrap()
            == vec![
                (1, FrameOutcome::Complete),
                (2, FrameOutcome::Complete),
                (3, FrameOutcome::Complete),
            ]
    );
    check!(event_loop.context().frames_in_progress() == 0);
    Ok(())
}

#[test]
pub fn without_barrier_frames_submit_back_to_back() -> Result<()> {
    common::setup_logger();
    let fences = Arc::new(FakeFenceDevice::default());
    let sink = Arc::new(common::RecordingSink::default());
    let mut event_loop = common::fake_loop(fences.clone(), sink, false);

    let log = Arc::new(SubmitLog::default());
    let queue = Arc::new(RenderQueue::new(
        "main",
        vec![QueuePass::new("solid", QueueOperations::GRAPHICS, log.clone())],
    )?);
    let outcomes = start_frames(&event_loop, &queue, 3);

    check!(tick_until(&mut event_loop, || log.submit_count() == 3)?);
    check!(outcomes.lock().unwrap().is_empty());
    check!(event_loop.context().frames_in_progress() == 3);

    fences.signal_all();
    check!(tick_until(&mut event_loop, || outcomes.lock().unwrap().len()
        == 3)?);
    Ok(())
}

#[test]
pub fn invalidated_frames_are_not_submitted() -> Result<()> {
    common::setup_logger();
    let fences = Arc::new(FakeFenceDevice::default());
    let sink = Arc::new(common::RecordingSink::default());
    let mut event_loop = common::fake_loop(fences.clone(), sink, true);

    let log = Arc::new(SubmitLog::default());
    let queue = Arc::new(RenderQueue::new(
        "main",
        vec![QueuePass::new("solid", QueueOperations::GRAPHICS, log.clone())],
    )?);
    let outcomes: Outcomes = Arc::default();
    let handle = event_loop.handle();
    let first = {
        let outcomes = outcomes.clone();
        handle.run_render_queue(
            FrameRequest::new(queue.clone(), 1).on_complete(
                move |order, outcome| {
                    outcomes.lock().unwrap().push((order, outcome))
                },
            ),
        )
    };
    check!(tick_until(&mut event_loop, || log.submit_count() == 1)?);

    let second = {
        let outcomes = outcomes.clone();
        handle.run_render_queue(
            FrameRequest::new(queue.clone(), 1).on_complete(
                move |order, outcome| {
                    outcomes.lock().unwrap().push((order, outcome))
                },
            ),
        )
    };
    second.invalidate();
    fences.signal_all();

    check!(tick_until(&mut event_loop, || outcomes.lock().unwrap().len()
        == 2)?);
    let outcomes = outcomes.lock().unwrap();
    check!(outcomes.contains(&(first.order(), FrameOutcome::Complete)));
    check!(outcomes.contains(&(second.order(), FrameOutcome::Invalidated)));
    check!(log.submit_count() == 1);
    Ok(())
}

#[test]
pub fn last_submission_is_reported_before_the_fences_signal() -> Result<()> {
    common::setup_logger();
    let fences = Arc::new(FakeFenceDevice::default());
    let sink = Arc::new(common::RecordingSink::default());
    let mut event_loop = common::fake_loop(fences.clone(), sink, false);

    let log = Arc::new(SubmitLog::default());
    let queue = Arc::new(RenderQueue::new(
        "main",
        vec![
            QueuePass::new("compose", QueueOperations::GRAPHICS, log.clone())
                .depends_on("solid"),
            QueuePass::new("solid", QueueOperations::GRAPHICS, log.clone()),
        ],
    )?);
    let submitted: Arc<Mutex<Vec<(u64, usize)>>> = Arc::default();
    let outcomes: Outcomes = Arc::default();
    let frame = {
        let submitted = submitted.clone();
        let submit_log = log.clone();
        let outcomes = outcomes.clone();
        event_loop.handle().run_render_queue(
            FrameRequest::new(queue.clone(), 1)
                .on_submitted(move |order| {
                    let passes = submit_log.submit_count();
                    submitted.lock().unwrap().push((order, passes));
                })
                .on_complete(move |order, outcome| {
                    outcomes.lock().unwrap().push((order, outcome))
                }),
        )
    };

    check!(tick_until(&mut event_loop, || !submitted
        .lock()
        .unwrap()
        .is_empty())?);
    check!(*submitted.lock().unwrap() == vec![(frame.order(), 2)]);
    check!(outcomes.lock().unwrap().is_empty());

    fences.signal_all();
    check!(tick_until(&mut event_loop, || outcomes.lock().unwrap().len()
        == 1)?);
    check!(submitted.lock().unwrap().len() == 1);
    Ok(())
}

/// Every element is dirty every frame.
struct Buffers(u32);

impl DescriptorBinding for Buffers {
    fn descriptor_array_size(&self) -> u32 {
        self.0
    }

    fn is_descriptor_dirty(&self, _index: u32) -> bool {
        true
    }

    fn descriptor(&self, index: u32) -> DescriptorInfo {
        DescriptorInfo::Buffer {
            buffer: vk::Buffer::from_raw(index as u64 + 1),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }
}

#[test]
pub fn update_after_bind_sets_are_written_on_workers() -> Result<()> {
    common::setup_logger();
    let fences = Arc::new(FakeFenceDevice::default());
    let sink = Arc::new(common::RecordingSink::default());
    let mut event_loop = common::fake_loop(fences.clone(), sink.clone(), true);

    let mut descriptors = DescriptorWriter::default();
    for (binding, update_after_bind) in [(0, false), (1, true)] {
        descriptors.add(BoundDescriptor {
            set: vk::DescriptorSet::from_raw(7),
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            update_after_bind,
            source: Arc::new(Buffers(4)),
        });
    }
    let log = Arc::new(SubmitLog::default());
    let queue = Arc::new(RenderQueue::new(
        "main",
        vec![
            QueuePass::new("solid", QueueOperations::GRAPHICS, log.clone())
                .with_descriptors(descriptors),
        ],
    )?);
    let outcomes = start_frames(&event_loop, &queue, 1);

    check!(tick_until(&mut event_loop, || log.submit_count() == 1)?);
    fences.signal_all();
    check!(tick_until(&mut event_loop, || outcomes.lock().unwrap().len()
        == 1)?);

    let loop_thread = std::thread::current().id();
    let recorded_on = log.recorded_on.lock().unwrap()[0].1;
    let writes = sink.writes.lock().unwrap();
    check!(writes.len() == 2);
    for (thread, batch) in writes.iter() {
        check!(batch.infos.len() == 4);
        if batch.binding == 0 {
            check!(*thread == loop_thread);
        } else {
            check!(*thread != loop_thread);
            check!(*thread == recorded_on);
        }
    }
    Ok(())
}
