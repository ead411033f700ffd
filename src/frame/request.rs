use {
    crate::{
        memory::DeviceMemoryPool,
        queue::{DeviceQueue, QueueOperations},
        render_pass::DescriptorWriter,
        RenderError,
    },
    ash::vk,
    std::{
        any::Any,
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex,
        },
    },
};

/// What a pass needs to know about the frame it runs in.
#[derive(Clone)]
pub struct FrameInfo {
    pub order: u64,
    pub generation: u64,
    pub pass: String,
    pub inputs: Arc<FrameInputs>,
    pub pool: Option<Arc<Mutex<DeviceMemoryPool>>>,
    valid: Arc<AtomicBool>,
}

impl FrameInfo {
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

/// Per-attachment data handed to a frame by whoever requested it.
#[derive(Default)]
pub struct FrameInputs {
    inputs: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl FrameInputs {
    pub fn insert(
        &mut self,
        attachment: impl Into<String>,
        input: impl Any + Send + Sync,
    ) {
        self.inputs.insert(attachment.into(), Box::new(input));
    }

    pub fn get<T: Any>(&self, attachment: &str) -> Option<&T> {
        self.inputs.get(attachment)?.downcast_ref()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// The per-pass work of a frame.
///
/// `prepare` runs on the loop thread, `record` on a worker, `submit` on the
/// loop thread again once the frame emitter lets the pass through.
pub trait PassExecutor: Send + Sync {
    fn prepare(&self, _frame: &FrameInfo) -> Result<(), RenderError> {
        Ok(())
    }

    fn record(&self, frame: &FrameInfo) -> Result<(), RenderError>;

    /// Submit the recorded work so that it signals `fence`.
    fn submit(
        &self,
        frame: &FrameInfo,
        queue: &DeviceQueue,
        fence: vk::Fence,
    ) -> Result<(), RenderError>;

    /// The frame was dropped before this pass was submitted.
    fn invalidate(&self, _frame: &FrameInfo) {}
}

/// One pass of a render queue.
#[derive(Clone)]
pub struct QueuePass {
    pub name: String,
    pub ops: QueueOperations,

    /// Async passes are not held back by the frame emitter barrier.
    pub async_pass: bool,

    /// Passes whose output this pass reads.
    pub dependencies: Vec<String>,

    pub descriptors: DescriptorWriter,
    pub executor: Arc<dyn PassExecutor>,
}

impl QueuePass {
    pub fn new(
        name: impl Into<String>,
        ops: QueueOperations,
        executor: Arc<dyn PassExecutor>,
    ) -> Self {
        Self {
            name: name.into(),
            ops,
            async_pass: false,
            dependencies: Vec::new(),
            descriptors: DescriptorWriter::default(),
            executor,
        }
    }

    pub fn depends_on(mut self, pass: impl Into<String>) -> Self {
        self.dependencies.push(pass.into());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.async_pass = true;
        self
    }

    pub fn with_descriptors(mut self, descriptors: DescriptorWriter) -> Self {
        self.descriptors = descriptors;
        self
    }
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// An ordered set of passes which frames run through.
pub struct RenderQueue {
    id: u64,
    name: String,
    passes: Vec<QueuePass>,
}

impl RenderQueue {
    /// Order `passes` so every pass runs after its dependencies.
    ///
    /// Passes without a dependency between them keep their given order.
    /// Unknown dependencies and cycles are errors.
    pub fn new(
        name: impl Into<String>,
        passes: Vec<QueuePass>,
    ) -> Result<Self, RenderError> {
        let name = name.into();
        let order = topological_order(&passes)?;
        let mut slots: Vec<Option<QueuePass>> =
            passes.into_iter().map(Some).collect();
        let passes = order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect::<Vec<_>>();
        log::debug!(
            "Render queue '{}': {:?}",
            name,
            passes.iter().map(|pass| pass.name.as_str()).collect::<Vec<_>>()
        );
        Ok(Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            passes,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn passes(&self) -> &[QueuePass] {
        &self.passes
    }
}

fn topological_order(passes: &[QueuePass]) -> Result<Vec<usize>, RenderError> {
    let index_of =
        |name: &str| passes.iter().position(|pass| pass.name == name);
    let mut dependencies = Vec::with_capacity(passes.len());
    for pass in passes {
        let mut indices = Vec::new();
        for dependency in &pass.dependencies {
            let index = index_of(dependency).ok_or_else(|| {
                anyhow::anyhow!(
                    "Pass '{}' depends on unknown pass '{}'",
                    pass.name,
                    dependency
                )
            })?;
            indices.push(index);
        }
        dependencies.push(indices);
    }

    let mut order = Vec::with_capacity(passes.len());
    let mut placed = vec![false; passes.len()];
    while order.len() < passes.len() {
        let next = (0..passes.len()).find(|&index| {
            !placed[index]
                && dependencies[index].iter().all(|&dep| placed[dep])
        });
        let Some(next) = next else {
            let remaining = passes
                .iter()
                .zip(&placed)
                .filter(|(_, placed)| !**placed)
                .map(|(pass, _)| pass.name.as_str())
                .collect::<Vec<_>>();
            return Err(anyhow::anyhow!(
                "Pass dependency cycle between {:?}",
                remaining
            )
            .into());
        };
        placed[next] = true;
        order.push(next);
    }
    Ok(order)
}

/// How a frame ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameOutcome {
    /// Every pass was submitted and its fence signaled.
    Complete,

    /// The frame was invalidated before it finished.
    Invalidated,

    /// A pass failed to prepare, record or submit.
    Failed,
}

pub type OutputFn = Box<dyn FnOnce(&FrameInfo) + Send>;
pub type CompleteFn = Box<dyn FnOnce(u64, FrameOutcome) + Send>;
pub type SubmittedFn = Box<dyn FnOnce(u64) + Send>;

/// Everything needed to run one frame through a render queue.
pub struct FrameRequest {
    pub queue: Arc<RenderQueue>,
    pub generation: u64,
    pub inputs: FrameInputs,

    /// Called with the frame once its attachment is final.
    pub outputs: Vec<(String, OutputFn)>,

    /// Called on the loop thread once the last pass is queued, before its
    /// fence signals.
    pub submitted: Option<SubmittedFn>,

    pub complete: Option<CompleteFn>,
}

impl FrameRequest {
    pub fn new(queue: Arc<RenderQueue>, generation: u64) -> Self {
        Self {
            queue,
            generation,
            inputs: FrameInputs::default(),
            outputs: Vec::new(),
            submitted: None,
            complete: None,
        }
    }

    pub fn with_input(
        mut self,
        attachment: impl Into<String>,
        input: impl Any + Send + Sync,
    ) -> Self {
        self.inputs.insert(attachment, input);
        self
    }

    pub fn on_output(
        mut self,
        attachment: impl Into<String>,
        output: impl FnOnce(&FrameInfo) + Send + 'static,
    ) -> Self {
        self.outputs.push((attachment.into(), Box::new(output)));
        self
    }

    pub fn on_submitted(
        mut self,
        submitted: impl FnOnce(u64) + Send + 'static,
    ) -> Self {
        self.submitted = Some(Box::new(submitted));
        self
    }

    pub fn on_complete(
        mut self,
        complete: impl FnOnce(u64, FrameOutcome) + Send + 'static,
    ) -> Self {
        self.complete = Some(Box::new(complete));
        self
    }
}

/// The requester's handle to a running frame.
#[derive(Debug, Clone)]
pub struct FrameHandle {
    order: u64,
    generation: u64,
    valid: Arc<AtomicBool>,
}

impl FrameHandle {
    pub(crate) fn new(order: u64, generation: u64) -> Self {
        Self {
            order,
            generation,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    /// The monotonic frame index.
    pub fn order(&self) -> u64 {
        self.order
    }

    /// The swapchain generation the frame renders for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Stop the frame. Passes which were not submitted yet are skipped.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn valid_flag(&self) -> Arc<AtomicBool> {
        self.valid.clone()
    }

    pub(crate) fn info(
        &self,
        pass: &str,
        inputs: Arc<FrameInputs>,
        pool: Option<Arc<Mutex<DeviceMemoryPool>>>,
    ) -> FrameInfo {
        FrameInfo {
            order: self.order,
            generation: self.generation,
            pass: pass.to_owned(),
            inputs,
            pool,
            valid: self.valid.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq};

    struct Nothing;

    impl PassExecutor for Nothing {
        fn record(&self, _frame: &FrameInfo) -> Result<(), RenderError> {
            Ok(())
        }

        fn submit(
            &self,
            _frame: &FrameInfo,
            _queue: &DeviceQueue,
            _fence: vk::Fence,
        ) -> Result<(), RenderError> {
            Ok(())
        }
    }

    fn pass(name: &str) -> QueuePass {
        QueuePass::new(name, QueueOperations::GRAPHICS, Arc::new(Nothing))
    }

    #[test]
    fn passes_follow_their_dependencies() {
        let queue = RenderQueue::new(
            "main",
            vec![
                pass("compose").depends_on("solid").depends_on("shadow"),
                pass("solid"),
                pass("shadow").depends_on("solid"),
            ],
        )
        .unwrap();
        let names = queue
            .passes()
            .iter()
            .map(|pass| pass.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["solid", "shadow", "compose"]);
    }

    #[test]
    fn cycles_and_unknown_passes_are_rejected() {
        let cycle = RenderQueue::new(
            "cycle",
            vec![pass("a").depends_on("b"), pass("b").depends_on("a")],
        );
        assert!(cycle.is_err());

        let unknown =
            RenderQueue::new("unknown", vec![pass("a").depends_on("z")]);
        assert!(unknown.is_err());
    }

    #[test]
    fn inputs_are_typed() {
        let mut inputs = FrameInputs::default();
        inputs.insert("color", 3_u32);
        assert_eq!(inputs.get::<u32>("color"), Some(&3));
        assert_eq!(inputs.get::<f32>("color"), None);
        assert_eq!(inputs.get::<u32>("depth"), None);
    }
}
