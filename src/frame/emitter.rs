use {
    super::LoopTask,
    std::collections::{HashMap, VecDeque},
};

#[derive(Default)]
struct QueueSlot {
    frames_in_progress: usize,
    submitting: bool,
    waiting: VecDeque<LoopTask>,
    submissions: u64,
}

/// Serializes the submissions of frames which share a render queue.
///
/// With the barrier enabled a submission for a render queue only starts
/// after the fence of the previous one signaled. Async passes skip the
/// barrier.
pub struct FrameEmitter {
    barrier: bool,
    slots: HashMap<u64, QueueSlot>,
}

impl FrameEmitter {
    pub fn new(barrier: bool) -> Self {
        Self {
            barrier,
            slots: HashMap::new(),
        }
    }

    pub fn has_barrier(&self) -> bool {
        self.barrier
    }

    pub fn frame_started(&mut self, queue_id: u64) {
        self.slots.entry(queue_id).or_default().frames_in_progress += 1;
    }

    pub fn frame_finished(&mut self, queue_id: u64) {
        if let Some(slot) = self.slots.get_mut(&queue_id) {
            slot.frames_in_progress = slot.frames_in_progress.saturating_sub(1);
        }
    }

    /// Frames of `queue_id` which started and have not finished.
    pub fn frames_in_progress(&self, queue_id: u64) -> usize {
        self.slots
            .get(&queue_id)
            .map_or(0, |slot| slot.frames_in_progress)
    }

    /// Total frames in progress across every render queue.
    pub fn total_frames_in_progress(&self) -> usize {
        self.slots.values().map(|slot| slot.frames_in_progress).sum()
    }

    /// Submissions granted so far for `queue_id`.
    pub fn submissions(&self, queue_id: u64) -> u64 {
        self.slots.get(&queue_id).map_or(0, |slot| slot.submissions)
    }

    /// Ask to submit for `queue_id`.
    ///
    /// Returns the task when it may run right away. Otherwise it is kept
    /// and handed back by [FrameEmitter::submission_complete].
    pub fn request_submit(
        &mut self,
        queue_id: u64,
        async_pass: bool,
        task: LoopTask,
    ) -> Option<LoopTask> {
        let barrier = self.barrier;
        let slot = self.slots.entry(queue_id).or_default();
        if async_pass || !barrier {
            slot.submissions += 1;
            return Some(task);
        }
        if slot.submitting {
            slot.waiting.push_back(task);
            return None;
        }
        slot.submitting = true;
        slot.submissions += 1;
        Some(task)
    }

    /// The fence of a barrier-holding submission signaled. Returns the next
    /// waiting submission, which now holds the barrier.
    pub fn submission_complete(&mut self, queue_id: u64) -> Option<LoopTask> {
        let slot = self.slots.get_mut(&queue_id)?;
        match slot.waiting.pop_front() {
            Some(task) => {
                slot.submissions += 1;
                Some(task)
            }
            None => {
                slot.submitting = false;
                None
            }
        }
    }

    /// Drop every waiting submission, used when the loop shuts down.
    pub fn drain(&mut self) -> Vec<LoopTask> {
        let mut tasks = Vec::new();
        for slot in self.slots.values_mut() {
            tasks.extend(slot.waiting.drain(..));
            slot.submitting = false;
        }
        tasks
    }
}
