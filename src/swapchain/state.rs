use {crate::RenderError, ash::vk};

/// Counters and deprecation state of one swapchain instance.
///
/// The acquired count is the number of images handed out by acquire which
/// have not been presented or invalidated yet. A deprecated swapchain keeps
/// working until that count drops to zero, then it is recreated.
#[derive(Debug, Clone)]
pub struct SwapchainState {
    present_mode: vk::PresentModeKHR,
    preferred_mode: vk::PresentModeKHR,
    fast_mode: vk::PresentModeKHR,
    max_suboptimal_frames: u32,
    acquired_images: u32,
    presented_frames: u32,
    deprecated: bool,
    rebuild_mode: Option<vk::PresentModeKHR>,
}

impl SwapchainState {
    pub fn new(
        present_mode: vk::PresentModeKHR,
        preferred_mode: vk::PresentModeKHR,
        fast_mode: vk::PresentModeKHR,
        max_suboptimal_frames: u32,
    ) -> Self {
        Self {
            present_mode,
            preferred_mode,
            fast_mode,
            max_suboptimal_frames,
            acquired_images: 0,
            presented_frames: 0,
            deprecated: false,
            rebuild_mode: None,
        }
    }

    pub fn acquired_images(&self) -> u32 {
        self.acquired_images
    }

    pub fn presented_frames(&self) -> u32 {
        self.presented_frames
    }

    pub fn is_deprecated(&self) -> bool {
        self.deprecated
    }

    /// The present mode the next swapchain should use.
    pub fn rebuild_mode(&self) -> vk::PresentModeKHR {
        self.rebuild_mode.unwrap_or(self.preferred_mode)
    }

    /// True when this instance runs in the fast mode as a stand-in for
    /// another preferred mode.
    pub fn is_fast_fallback(&self) -> bool {
        self.present_mode == self.fast_mode
            && self.present_mode != self.preferred_mode
    }

    /// Record the result of `vkAcquireNextImageKHR`.
    ///
    /// Returns the image index, or `None` when no image was ready within the
    /// timeout. A suboptimal image is accepted and deprecates the swapchain.
    pub fn on_acquire(
        &mut self,
        result: Result<(u32, bool), vk::Result>,
    ) -> Result<Option<u32>, RenderError> {
        match result {
            Ok((index, suboptimal)) => {
                self.acquired_images += 1;
                if suboptimal {
                    log::debug!("Acquired a suboptimal image");
                    self.deprecate(false);
                }
                Ok(Some(index))
            }
            Err(vk::Result::NOT_READY | vk::Result::TIMEOUT) => Ok(None),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.deprecate(false);
                Err(RenderError::SwapchainOutOfDate)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Record the result of `vkQueuePresentKHR` for an acquired image.
    ///
    /// Returns true when the swapchain asks to be rebuilt.
    pub fn on_present(
        &mut self,
        result: Result<bool, vk::Result>,
    ) -> Result<bool, RenderError> {
        self.release_image();
        match result {
            Ok(suboptimal) => {
                self.presented_frames += 1;
                if suboptimal {
                    self.deprecate(false);
                }
                if self.is_fast_fallback()
                    && self.presented_frames >= self.max_suboptimal_frames
                    && !self.deprecated
                {
                    log::debug!(
                        "Leaving {:?} after {} frames",
                        self.present_mode,
                        self.presented_frames
                    );
                    self.deprecated = true;
                    self.rebuild_mode = Some(self.preferred_mode);
                }
                Ok(self.deprecated)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.deprecate(false);
                Err(RenderError::SwapchainOutOfDate)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// An acquired image was dropped without being presented.
    pub fn on_invalidate(&mut self) {
        self.release_image();
    }

    /// Mark the swapchain stale. A fast deprecation rebuilds into the fast
    /// present mode, used while the surface is being resized.
    pub fn deprecate(&mut self, fast: bool) {
        self.deprecated = true;
        if fast {
            self.rebuild_mode = Some(self.fast_mode);
        }
    }

    /// Recreation waits for every acquired image to come back.
    pub fn can_recreate(&self) -> bool {
        self.deprecated && self.acquired_images == 0
    }

    fn release_image(&mut self) {
        match self.acquired_images.checked_sub(1) {
            Some(count) => self.acquired_images = count,
            None => log::error!("Released more swapchain images than acquired"),
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq};

    fn state() -> SwapchainState {
        SwapchainState::new(
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
            3,
        )
    }

    #[test]
    fn deprecated_swapchains_wait_for_acquired_images() {
        let mut state = state();
        assert_eq!(state.on_acquire(Ok((0, false))).unwrap(), Some(0));
        assert_eq!(state.on_acquire(Ok((1, false))).unwrap(), Some(1));

        state.deprecate(false);
        assert!(!state.can_recreate());

        assert!(state.on_present(Ok(false)).unwrap());
        assert!(!state.can_recreate());
        state.on_present(Ok(false)).unwrap();
        assert!(state.can_recreate());
        assert_eq!(state.rebuild_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn suboptimal_images_are_accepted() {
        let mut state = state();
        assert_eq!(state.on_acquire(Ok((2, true))).unwrap(), Some(2));
        assert!(state.is_deprecated());
        assert_eq!(state.acquired_images(), 1);
    }

    #[test]
    fn out_of_date_acquire_fails() {
        let mut state = state();
        assert!(matches!(
            state.on_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Err(RenderError::SwapchainOutOfDate)
        ));
        assert!(state.can_recreate());
        assert_eq!(
            state.on_acquire(Err(vk::Result::NOT_READY)).unwrap(),
            None
        );
    }

    #[test]
    fn fast_mode_returns_to_preferred_mode() {
        let mut fast = SwapchainState::new(
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
            3,
        );
        for _ in 0..2 {
            fast.on_acquire(Ok((0, false))).unwrap();
            assert!(!fast.on_present(Ok(false)).unwrap());
        }
        fast.on_acquire(Ok((0, false))).unwrap();
        assert!(fast.on_present(Ok(false)).unwrap());
        assert_eq!(fast.rebuild_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn fast_deprecation_rebuilds_in_fast_mode() {
        let mut state = state();
        state.deprecate(true);
        assert_eq!(state.rebuild_mode(), vk::PresentModeKHR::IMMEDIATE);
    }
}
