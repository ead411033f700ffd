use {
    super::request::{
        CompleteFn, FrameHandle, FrameInputs, FrameOutcome, OutputFn,
        RenderQueue, SubmittedFn,
    },
    crate::memory::DeviceMemoryPool,
    std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    },
};

/// The loop's record of one frame in flight.
pub(crate) struct FrameNode {
    pub handle: FrameHandle,
    pub queue: Arc<RenderQueue>,
    pub inputs: Arc<FrameInputs>,
    pub pool: Option<Arc<Mutex<DeviceMemoryPool>>>,
    pub outputs: Vec<(String, OutputFn)>,
    pub submitted: Option<SubmittedFn>,
    pub complete: Option<CompleteFn>,

    /// Index of the next pass to schedule.
    pub next_pass: usize,

    /// Submissions whose fence has not signaled yet.
    pub pending_fences: usize,

    /// Outstanding work which still refers to the frame.
    pub refs: usize,

    pub outcome: Option<FrameOutcome>,
}

impl FrameNode {
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Frames owned by the loop, keyed by their monotonic order.
///
/// Work running elsewhere refers to frames by order only. A finished frame
/// is dropped by [FrameQueue::collect] once nothing refers to it.
#[derive(Default)]
pub struct FrameQueue {
    nodes: BTreeMap<u64, FrameNode>,
    last_order: u64,
}

impl FrameQueue {
    /// The newest order inserted so far.
    pub fn last_order(&self) -> u64 {
        self.last_order
    }

    pub(crate) fn insert(&mut self, node: FrameNode) {
        self.last_order = self.last_order.max(node.handle.order());
        self.nodes.insert(node.handle.order(), node);
    }

    pub(crate) fn get_mut(&mut self, order: u64) -> Option<&mut FrameNode> {
        self.nodes.get_mut(&order)
    }

    pub fn retain(&mut self, order: u64) {
        if let Some(node) = self.nodes.get_mut(&order) {
            node.refs += 1;
        }
    }

    pub fn release(&mut self, order: u64) {
        if let Some(node) = self.nodes.get_mut(&order) {
            node.refs = node.refs.saturating_sub(1);
        }
    }

    /// Frames which have not finished.
    pub fn active(&self) -> usize {
        self.nodes.values().filter(|node| !node.is_finished()).count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every frame at or below this order has finished.
    pub fn completed_watermark(&self) -> u64 {
        self.nodes
            .values()
            .filter(|node| !node.is_finished())
            .map(|node| node.handle.order() - 1)
            .min()
            .unwrap_or(self.last_order)
    }

    /// Drop finished frames nothing refers to. Returns how many were
    /// dropped.
    pub fn collect(&mut self) -> usize {
        let before = self.nodes.len();
        self.nodes
            .retain(|_, node| !(node.is_finished() && node.refs == 0));
        before - self.nodes.len()
    }

    /// Orders of every frame which has not finished.
    pub fn unfinished(&self) -> Vec<u64> {
        self.nodes
            .iter()
            .filter(|(_, node)| !node.is_finished())
            .map(|(order, _)| *order)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::frame::request::RenderQueue,
        pretty_assertions::assert_eq,
    };

    fn node(order: u64) -> FrameNode {
        FrameNode {
            handle: FrameHandle::new(order, 0),
            queue: Arc::new(RenderQueue::new("empty", vec![]).unwrap()),
            inputs: Arc::new(FrameInputs::default()),
            pool: None,
            outputs: Vec::new(),
            submitted: None,
            complete: None,
            next_pass: 0,
            pending_fences: 0,
            refs: 0,
            outcome: None,
        }
    }

    #[test]
    fn finished_frames_are_collected_once_released() {
        let mut frames = FrameQueue::default();
        frames.insert(node(1));
        frames.insert(node(2));
        assert_eq!(frames.completed_watermark(), 0);

        frames.retain(1);
        frames.get_mut(1).unwrap().outcome = Some(FrameOutcome::Complete);
        assert_eq!(frames.completed_watermark(), 1);
        assert_eq!(frames.collect(), 0);

        frames.release(1);
        assert_eq!(frames.collect(), 1);
        assert_eq!(frames.unfinished(), vec![2]);

        frames.get_mut(2).unwrap().outcome = Some(FrameOutcome::Invalidated);
        assert_eq!(frames.completed_watermark(), 2);
        assert_eq!(frames.collect(), 1);
        assert!(frames.is_empty());
    }
}
