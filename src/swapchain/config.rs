use {
    crate::{PresentModePreference, RenderError},
    ash::vk,
};

/// What a surface supports.
#[derive(Debug, Clone)]
pub struct SurfaceInfo {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceInfo {
    /// Query the surface.
    ///
    /// # Safety
    ///
    /// Unsafe because the surface must belong to the loader's instance.
    pub unsafe fn query(
        loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self, RenderError> {
        let capabilities = loader.get_physical_device_surface_capabilities(
            physical_device,
            surface,
        )?;
        let formats = loader
            .get_physical_device_surface_formats(physical_device, surface)?;
        let present_modes = loader.get_physical_device_surface_present_modes(
            physical_device,
            surface,
        )?;
        log::debug!(
            "Surface supports {} formats and {:?}",
            formats.len(),
            present_modes
        );
        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// True when a swapchain can be built for the surface.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }

    /// A zero extent means the surface is minimized.
    pub fn is_visible(&self) -> bool {
        let extent = self.capabilities.current_extent;
        extent.width != 0 && extent.height != 0
    }
}

/// The parameters a swapchain is built with.
#[derive(Debug, Copy, Clone)]
pub struct SwapchainConfig {
    pub image_count: u32,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub extent: vk::Extent2D,
    pub transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub usage: vk::ImageUsageFlags,
}

impl SwapchainConfig {
    /// Pick a configuration for the surface.
    ///
    /// # Params
    ///
    /// * `info` - what the surface supports
    /// * `requested_extent` - used when the surface leaves the extent to the
    ///   swapchain
    /// * `present_mode` - the preferred present mode
    pub fn select(
        info: &SurfaceInfo,
        requested_extent: vk::Extent2D,
        present_mode: PresentModePreference,
    ) -> Result<Self, RenderError> {
        if !info.is_adequate() {
            return Err(anyhow::anyhow!(
                "The surface reports no formats or present modes"
            )
            .into());
        }
        let caps = &info.capabilities;
        let surface_format = choose_surface_format(&info.formats);
        let present_mode =
            choose_present_mode(&info.present_modes, present_mode.as_vk());
        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        // offscreen rendering blits into the swapchain
        if caps
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST)
        {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        Ok(Self {
            image_count: choose_image_count(caps, present_mode),
            format: surface_format.format,
            color_space: surface_format.color_space,
            extent: choose_extent(caps, requested_extent),
            transform: caps.current_transform,
            composite_alpha: choose_composite_alpha(
                caps.supported_composite_alpha,
            ),
            present_mode,
            usage,
        })
    }

    /// The same configuration with another present mode, if supported.
    pub fn with_present_mode(
        &self,
        info: &SurfaceInfo,
        present_mode: vk::PresentModeKHR,
    ) -> Self {
        let present_mode =
            choose_present_mode(&info.present_modes, present_mode);
        Self {
            present_mode,
            image_count: choose_image_count(&info.capabilities, present_mode),
            ..*self
        }
    }

    /// The transform is a quarter turn so width and height are swapped
    /// relative to the presented image.
    pub fn is_rotated(&self) -> bool {
        self.transform.intersects(
            vk::SurfaceTransformFlagsKHR::ROTATE_90
                | vk::SurfaceTransformFlagsKHR::ROTATE_270
                | vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR_ROTATE_90
                | vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR_ROTATE_270,
        )
    }
}

/// One more than the minimum so the application never waits on the
/// presentation engine, within the surface's maximum. Mailbox wants three.
pub fn choose_image_count(
    caps: &vk::SurfaceCapabilitiesKHR,
    present_mode: vk::PresentModeKHR,
) -> u32 {
    let desired = if present_mode == vk::PresentModeKHR::MAILBOX {
        (caps.min_image_count + 1).max(3)
    } else {
        caps.min_image_count + 1
    };
    if caps.max_image_count == 0 {
        desired
    } else {
        desired.min(caps.max_image_count)
    }
}

/// Prefer 8-bit BGRA in the sRGB color space.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> vk::SurfaceFormatKHR {
    let preferred = [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];
    for format in preferred {
        let found = formats.iter().find(|candidate| {
            candidate.format == format
                && candidate.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        });
        if let Some(found) = found {
            return *found;
        }
    }
    log::warn!("Using first available surface format {:?}", formats[0]);
    formats[0]
}

/// Use the preferred mode when supported and FIFO, which every surface
/// supports, otherwise.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        return preferred;
    }
    log::debug!("{:?} is not supported, falling back to FIFO", preferred);
    vk::PresentModeKHR::FIFO
}

pub fn choose_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

pub fn choose_composite_alpha(
    supported: vk::CompositeAlphaFlagsKHR,
) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|flag| supported.contains(*flag))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}
