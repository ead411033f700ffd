//! Swapchain creation, image acquisition and presentation.

mod config;
mod semaphores;
mod state;

use {
    crate::{
        device::{Device, DeviceObject, ImageView, ImageViewInfo, Semaphore},
        EngineOptions, RenderError,
    },
    ash::vk,
    std::{
        sync::{Arc, Mutex, Weak},
        time::Duration,
    },
};

pub use self::{
    config::{
        choose_composite_alpha, choose_extent, choose_image_count,
        choose_present_mode, choose_surface_format, SurfaceInfo,
        SwapchainConfig,
    },
    semaphores::{ImageSemaphores, SwapchainSemaphores},
    state::SwapchainState,
};

/// How long acquisition may block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AcquireTimeout {
    /// Return immediately when no image is ready.
    Lockfree,

    /// Wait for as long as it takes.
    Blocking,

    Timeout(Duration),
}

impl AcquireTimeout {
    pub fn as_nanos(&self) -> u64 {
        match self {
            AcquireTimeout::Lockfree => 0,
            AcquireTimeout::Blocking => u64::MAX,
            AcquireTimeout::Timeout(duration) => {
                u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
            }
        }
    }
}

/// The lifecycle of an acquired image.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SwapchainImageState {
    Initial,
    Submitted,
    Presented,
}

/// An image acquired from a swapchain.
///
/// Dropping an image which was never presented returns it to the swapchain
/// as invalidated.
#[derive(Debug)]
pub struct SwapchainImage {
    swapchain: Weak<SwapchainHandle>,
    generation: u64,
    index: u32,
    image: vk::Image,
    view: ImageView,
    semaphores: Option<ImageSemaphores>,
    state: SwapchainImageState,
}

impl SwapchainImage {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> &ImageView {
        &self.view
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SwapchainImageState {
        self.state
    }

    /// The semaphore signaled when the image is ready to be rendered into.
    pub fn wait_semaphore(&self) -> vk::Semaphore {
        self.semaphores
            .as_ref()
            .map_or(vk::Semaphore::null(), |pair| pair.acquire.raw())
    }

    /// The semaphore the frame's last submission signals. The present
    /// waits on it.
    pub fn signal_semaphore(&self) -> vk::Semaphore {
        self.semaphores
            .as_ref()
            .map_or(vk::Semaphore::null(), |pair| pair.present.raw())
    }

    /// Every submission writing the image has been queued.
    pub fn mark_submitted(&mut self) {
        if let Some(pair) = &mut self.semaphores {
            pair.acquire.set_waited();
        }
        self.state = SwapchainImageState::Submitted;
    }

    /// False once the swapchain has been dropped.
    pub fn is_valid(&self) -> bool {
        self.swapchain.strong_count() > 0
    }
}

impl Drop for SwapchainImage {
    fn drop(&mut self) {
        if self.state == SwapchainImageState::Presented {
            return;
        }
        if let Some(swapchain) = self.swapchain.upgrade() {
            swapchain.invalidate_image(self.semaphores.take());
        }
    }
}

/// A Vulkan swapchain plus its views, semaphores and counters.
pub struct SwapchainHandle {
    device: Arc<Device>,
    loader: ash::khr::swapchain::Device,
    raw: vk::SwapchainKHR,
    surface: vk::SurfaceKHR,
    config: SwapchainConfig,
    generation: u64,
    images: Vec<vk::Image>,
    views: Vec<ImageView>,
    semaphores: Mutex<SwapchainSemaphores>,
    state: Mutex<SwapchainState>,
}

// Public API
// ----------

impl SwapchainHandle {
    /// Create a swapchain, optionally replacing `old`.
    ///
    /// The old swapchain's semaphore pool migrates into the new one.
    ///
    /// # Safety
    ///
    /// Unsafe because the surface must outlive the swapchain, and `old` must
    /// not acquire any more images.
    pub unsafe fn new(
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        config: SwapchainConfig,
        options: &EngineOptions,
        old: Option<&SwapchainHandle>,
    ) -> Result<Arc<Self>, RenderError> {
        let loader =
            ash::khr::swapchain::Device::new(device.instance(), device.raw());
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(config.image_count)
            .image_format(config.format)
            .image_color_space(config.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(config.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(config.transform)
            .composite_alpha(config.composite_alpha)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |old| old.raw));
        let raw = loader.create_swapchain(&create_info, None)?;

        let images = match loader.get_swapchain_images(raw) {
            Ok(images) => images,
            Err(err) => {
                loader.destroy_swapchain(raw, None);
                return Err(err.into());
            }
        };

        let view_info = ImageViewInfo {
            view_type: vk::ImageViewType::TYPE_2D,
            format: config.format,
            range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
        };
        let mut views = Vec::with_capacity(images.len());
        for image in &images {
            match device.image_view(*image, view_info) {
                Ok(view) => views.push(view),
                Err(err) => {
                    for image in &images {
                        device.forget_image(*image);
                    }
                    loader.destroy_swapchain(raw, None);
                    return Err(err);
                }
            }
        }

        let mut semaphores = SwapchainSemaphores::new(images.len());
        if let Some(old) = old {
            let parked = semaphores
                .migrate_from(&mut old.semaphores.lock().unwrap());
            device.retire_in_flight(semaphore_objects(parked));
        }

        let state = SwapchainState::new(
            config.present_mode,
            options.present_mode.as_vk(),
            options.fast_present_mode.as_vk(),
            options.max_suboptimal_frames,
        );
        let generation = old.map_or(0, |old| old.generation + 1);

        log::info!(
            "Swapchain generation {}: {} images {}x{} {:?} {:?}",
            generation,
            images.len(),
            config.extent.width,
            config.extent.height,
            config.format,
            config.present_mode
        );

        Ok(Arc::new(Self {
            loader,
            raw,
            surface,
            config,
            generation,
            images,
            views,
            semaphores: Mutex::new(semaphores),
            state: Mutex::new(state),
            device,
        }))
    }

    pub fn raw(&self) -> vk::SwapchainKHR {
        self.raw
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn acquired_images(&self) -> u32 {
        self.state.lock().unwrap().acquired_images()
    }

    pub fn is_deprecated(&self) -> bool {
        self.state.lock().unwrap().is_deprecated()
    }

    pub fn can_recreate(&self) -> bool {
        self.state.lock().unwrap().can_recreate()
    }

    pub fn rebuild_mode(&self) -> vk::PresentModeKHR {
        self.state.lock().unwrap().rebuild_mode()
    }

    pub fn deprecate(&self, fast: bool) {
        log::debug!(
            "Deprecating swapchain generation {} (fast: {})",
            self.generation,
            fast
        );
        self.state.lock().unwrap().deprecate(fast);
    }

    /// Acquire the next image.
    ///
    /// Returns `None` when no image became ready within the timeout.
    pub fn acquire(
        self: &Arc<Self>,
        timeout: AcquireTimeout,
    ) -> Result<Option<SwapchainImage>, RenderError> {
        let mut pair = self
            .semaphores
            .lock()
            .unwrap()
            .begin_acquire(|| self.device.create_semaphore())?;
        let result = unsafe {
            self.loader.acquire_next_image(
                self.raw,
                timeout.as_nanos(),
                pair.acquire.raw(),
                vk::Fence::null(),
            )
        };
        let acquired = self.state.lock().unwrap().on_acquire(result);
        let index = match acquired {
            Ok(Some(index)) => index,
            Ok(None) => {
                self.semaphores.lock().unwrap().cancel_acquire(pair);
                return Ok(None);
            }
            Err(err) => {
                self.semaphores.lock().unwrap().cancel_acquire(pair);
                return Err(err);
            }
        };
        self.semaphores.lock().unwrap().acquired(index, &mut pair);

        Ok(Some(SwapchainImage {
            swapchain: Arc::downgrade(self),
            generation: self.generation,
            index,
            image: self.images[index as usize],
            view: self.views[index as usize],
            semaphores: Some(pair),
            state: SwapchainImageState::Initial,
        }))
    }

    /// Queue the present of an image behind its signal semaphore.
    ///
    /// Call once the frame's last submission is queued. Returns true when
    /// the swapchain asks to be rebuilt.
    pub fn present(
        &self,
        queue: vk::Queue,
        image: &mut SwapchainImage,
    ) -> Result<bool, RenderError> {
        if image.generation != self.generation {
            return Err(anyhow::anyhow!(
                "Image of swapchain generation {} presented to generation {}",
                image.generation,
                self.generation
            )
            .into());
        }
        let Some(pair) = image.semaphores.take() else {
            return Err(anyhow::anyhow!(
                "Image {} of swapchain generation {} was already presented",
                image.index,
                self.generation
            )
            .into());
        };
        let wait = self.semaphores.lock().unwrap().present(image.index, pair);
        let swapchains = [self.raw];
        let indices = [image.index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        image.state = SwapchainImageState::Presented;
        self.state.lock().unwrap().on_present(result)
    }
}

impl Drop for SwapchainHandle {
    fn drop(&mut self) {
        for image in &self.images {
            self.device.forget_image(*image);
        }
        let mut objects =
            semaphore_objects(self.semaphores.lock().unwrap().drain());
        objects.push(DeviceObject::Swapchain(self.raw));
        self.device.retire_in_flight(objects);
    }
}

// Private API
// -----------

impl SwapchainHandle {
    fn invalidate_image(&self, semaphores: Option<ImageSemaphores>) {
        self.state.lock().unwrap().on_invalidate();
        // either may have been signaled without a matching wait
        if let Some(pair) = semaphores {
            self.device.retire_in_flight(semaphore_objects([
                pair.acquire,
                pair.present,
            ]));
        }
    }
}

fn semaphore_objects(
    semaphores: impl IntoIterator<Item = Semaphore>,
) -> Vec<DeviceObject> {
    semaphores
        .into_iter()
        .map(|semaphore| DeviceObject::Semaphore(semaphore.raw()))
        .collect()
}
