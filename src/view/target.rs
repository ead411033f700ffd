use {
    super::{FrameStart, SwapchainStatus, ViewHandle, ViewTarget},
    crate::{
        device::Device,
        frame::{FrameHandle, FrameRequest, LoopHandle},
        queue::{QueueOperations, QueuePool},
        swapchain::{
            SurfaceInfo, SwapchainConfig, SwapchainHandle, SwapchainImage,
        },
        EngineOptions, RenderError,
    },
    anyhow::anyhow,
    ash::vk,
    std::{collections::HashMap, sync::Arc, time::Duration},
};

/// How long a non-inline present waits for a present queue before it is
/// retried on the next tick.
const PRESENT_QUEUE_TIMEOUT: Duration = Duration::from_millis(1);

/// The swapchain image a frame renders for.
#[derive(Debug, Copy, Clone)]
pub struct SwapchainFrame {
    pub generation: u64,
    pub index: u32,
    pub image: vk::Image,
    pub view: vk::ImageView,

    /// Submissions writing the image must wait on this semaphore.
    pub wait_semaphore: vk::Semaphore,

    /// The frame's last submission must signal this semaphore. The present
    /// waits on it.
    pub signal_semaphore: vk::Semaphore,

    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub transform: vk::SurfaceTransformFlagsKHR,

    /// The frame renders off-screen and blits into `image`.
    pub offscreen: bool,
}

/// Builds the frame request for an acquired image.
pub type FrameBuilder = Box<
    dyn FnMut(&SwapchainFrame) -> Result<FrameRequest, RenderError> + Send,
>;

struct PendingFrame {
    handle: FrameHandle,
    image: SwapchainImage,
}

/// Renders into a surface's swapchain through the frame loop.
pub struct SwapchainTarget {
    device: Arc<Device>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    requested_extent: vk::Extent2D,
    options: EngineOptions,
    queues: Arc<QueuePool>,
    loop_handle: LoopHandle,
    builder: FrameBuilder,
    swapchain: Option<Arc<SwapchainHandle>>,
    frames: HashMap<u64, PendingFrame>,
}

impl SwapchainTarget {
    /// The swapchain is built on the view thread's first tick.
    ///
    /// # Safety
    ///
    /// Unsafe because the surface must outlive the target and belong to the
    /// loader's instance.
    pub unsafe fn new(
        device: Arc<Device>,
        surface_loader: ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        requested_extent: vk::Extent2D,
        options: EngineOptions,
        queues: Arc<QueuePool>,
        loop_handle: LoopHandle,
        builder: FrameBuilder,
    ) -> Self {
        Self {
            device,
            surface_loader,
            surface,
            requested_extent,
            options,
            queues,
            loop_handle,
            builder,
            swapchain: None,
            frames: HashMap::new(),
        }
    }

    pub fn swapchain(&self) -> Option<&Arc<SwapchainHandle>> {
        self.swapchain.as_ref()
    }
}

impl ViewTarget for SwapchainTarget {
    fn status(&self) -> SwapchainStatus {
        self.swapchain
            .as_ref()
            .map_or(SwapchainStatus::default(), |swapchain| SwapchainStatus {
                available: true,
                deprecated: swapchain.is_deprecated(),
                acquired_images: swapchain.acquired_images(),
            })
    }

    fn start_frame(
        &mut self,
        start: FrameStart,
        view: &ViewHandle,
    ) -> Result<Option<u64>, RenderError> {
        let Some(swapchain) = self.swapchain.clone() else {
            return Ok(None);
        };
        let Some(image) = swapchain.acquire(start.timeout)? else {
            return Ok(None);
        };
        let config = swapchain.config();
        let frame = SwapchainFrame {
            generation: image.generation(),
            index: image.index(),
            image: image.image(),
            view: image.view().raw,
            wait_semaphore: image.wait_semaphore(),
            signal_semaphore: image.signal_semaphore(),
            format: config.format,
            extent: config.extent,
            transform: config.transform,
            offscreen: start.offscreen,
        };

        // the image is invalidated when it drops on error
        let mut request = (self.builder)(&frame)?;
        let requested_submit = request.submitted.take();
        let requested_complete = request.complete.take();
        let submitted_view = view.clone();
        let view = view.clone();
        let request = request
            .on_submitted(move |order| {
                if let Some(requested) = requested_submit {
                    requested(order);
                }
                submitted_view.frame_submitted(order);
            })
            .on_complete(move |order, outcome| {
                if let Some(requested) = requested_complete {
                    requested(order, outcome);
                }
                view.frame_complete(order, outcome);
            });

        let handle = self.loop_handle.run_render_queue(request);
        let order = handle.order();
        self.frames.insert(order, PendingFrame { handle, image });
        Ok(Some(order))
    }

    fn present(
        &mut self,
        order: u64,
        inline: bool,
    ) -> Result<bool, RenderError> {
        let Some(mut frame) = self.frames.remove(&order) else {
            return Err(
                anyhow!("Frame {} holds no swapchain image", order).into()
            );
        };
        let Some(swapchain) = self.swapchain.clone() else {
            return Err(
                anyhow!("Frame {} outlived its swapchain", order).into()
            );
        };

        let queue = if inline {
            self.queues.try_acquire_queue_sync(QueueOperations::PRESENT, true)
        } else {
            self.queues.try_acquire_queue_timeout(
                QueueOperations::PRESENT,
                PRESENT_QUEUE_TIMEOUT,
            )
        };
        let Some(queue) = queue else {
            self.frames.insert(order, frame);
            return Ok(false);
        };

        frame.image.mark_submitted();
        let result = swapchain.present(queue.raw(), &mut frame.image);
        self.queues.release_queue(queue);
        result.map(|_| true)
    }

    fn discard(&mut self, order: u64) {
        if let Some(frame) = self.frames.remove(&order) {
            frame.handle.invalidate();
        }
    }

    fn invalidate_frames(&mut self) {
        for (_, frame) in self.frames.drain() {
            frame.handle.invalidate();
        }
    }

    fn deprecate(&mut self, fast: bool) {
        if let Some(swapchain) = &self.swapchain {
            swapchain.deprecate(fast);
        }
    }

    fn recreate(&mut self) -> Result<(), RenderError> {
        let info = unsafe {
            SurfaceInfo::query(
                &self.surface_loader,
                self.device.physical_device(),
                self.surface,
            )?
        };
        if !info.is_visible() {
            if self.swapchain.take().is_some() {
                log::debug!("Surface hidden, swapchain released");
            }
            return Ok(());
        }

        let old = self.swapchain.take();
        let mut config = SwapchainConfig::select(
            &info,
            self.requested_extent,
            self.options.present_mode,
        )?;
        if let Some(old) = &old {
            config = config.with_present_mode(&info, old.rebuild_mode());
        }
        let created = unsafe {
            SwapchainHandle::new(
                self.device.clone(),
                self.surface,
                config,
                &self.options,
                old.as_deref(),
            )
        };
        match created {
            Ok(swapchain) => {
                self.swapchain = Some(swapchain);
                Ok(())
            }
            Err(err) => {
                self.swapchain = old;
                Err(err)
            }
        }
    }
}
