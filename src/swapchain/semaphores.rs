use {
    crate::{
        device::{Semaphore, SemaphorePool},
        RenderError,
    },
    ash::vk,
};

/// The two semaphores which order one acquired image's work.
#[derive(Debug)]
pub struct ImageSemaphores {
    /// Signaled by the acquire, waited on by the frame's first submission.
    pub acquire: Semaphore,

    /// Signaled by the frame's last submission, waited on by the present.
    pub present: Semaphore,
}

/// A swapchain's free semaphores plus the pair each image was last
/// presented with.
///
/// A presented pair stays parked on its image until that image is acquired
/// again, which is the first point the presentation engine is known to be
/// done with it.
#[derive(Debug, Default)]
pub struct SwapchainSemaphores {
    pool: SemaphorePool,
    presented: Vec<Option<ImageSemaphores>>,
}

impl SwapchainSemaphores {
    pub fn new(image_count: usize) -> Self {
        Self {
            pool: SemaphorePool::default(),
            presented: (0..image_count).map(|_| None).collect(),
        }
    }

    /// Take over the free pool of the swapchain being replaced.
    ///
    /// Returns the old swapchain's parked semaphores. Their presents may
    /// still be pending, so they are destroyed rather than reused.
    pub fn migrate_from(
        &mut self,
        old: &mut SwapchainSemaphores,
    ) -> Vec<Semaphore> {
        old.pool.migrate_into(&mut self.pool);
        old.take_presented()
    }

    /// The semaphores for the next acquire and the frame rendered into it.
    pub fn begin_acquire(
        &mut self,
        mut create: impl FnMut() -> Result<vk::Semaphore, RenderError>,
    ) -> Result<ImageSemaphores, RenderError> {
        let acquire = self.pool.acquire(&mut create)?;
        let present = match self.pool.acquire(&mut create) {
            Ok(present) => present,
            Err(err) => {
                self.pool.release(acquire);
                return Err(err);
            }
        };
        Ok(ImageSemaphores { acquire, present })
    }

    /// The acquire returned no image, so nothing will signal either
    /// semaphore.
    pub fn cancel_acquire(&mut self, semaphores: ImageSemaphores) {
        self.pool.release(semaphores.acquire);
        self.pool.release(semaphores.present);
    }

    /// Image `index` was acquired.
    ///
    /// The pair parked on the image by its previous present returns to the
    /// pool.
    pub fn acquired(&mut self, index: u32, semaphores: &mut ImageSemaphores) {
        semaphores.acquire.set_signaled();
        semaphores.present.set_signaled();
        let previous = self
            .presented
            .get_mut(index as usize)
            .and_then(Option::take);
        if let Some(previous) = previous {
            for mut semaphore in [previous.acquire, previous.present] {
                semaphore.set_released();
                self.pool.release(semaphore);
            }
        }
    }

    /// Image `index` is being presented.
    ///
    /// Returns the semaphores the present waits on. Both semaphores count
    /// as waited from here, even when the present is rejected, and stay
    /// parked until the image comes back.
    pub fn present(
        &mut self,
        index: u32,
        mut semaphores: ImageSemaphores,
    ) -> [vk::Semaphore; 1] {
        semaphores.acquire.set_waited();
        semaphores.present.set_waited();
        let wait = [semaphores.present.raw()];
        match self.presented.get_mut(index as usize) {
            Some(slot) => *slot = Some(semaphores),
            None => {
                log::warn!("Presented image {} is out of range", index);
            }
        }
        wait
    }

    pub fn free_count(&self) -> usize {
        self.pool.len()
    }

    pub fn parked_count(&self) -> usize {
        self.presented.iter().flatten().count()
    }

    /// Remove every semaphore for destruction.
    pub fn drain(&mut self) -> Vec<Semaphore> {
        let mut semaphores = self.pool.drain();
        semaphores.extend(self.take_presented());
        semaphores
    }
}

// Private API
// -----------

impl SwapchainSemaphores {
    fn take_presented(&mut self) -> Vec<Semaphore> {
        self.presented
            .iter_mut()
            .filter_map(Option::take)
            .flat_map(|pair| [pair.acquire, pair.present])
            .collect()
    }
}

#[cfg(test)]
mod test {
    use {super::*, ash::vk::Handle, pretty_assertions::assert_eq};

    fn counter() -> impl FnMut() -> Result<vk::Semaphore, RenderError> {
        let mut next = 0;
        move || {
            next += 1;
            Ok(vk::Semaphore::from_raw(next))
        }
    }

    fn acquire(
        semaphores: &mut SwapchainSemaphores,
        create: &mut impl FnMut() -> Result<vk::Semaphore, RenderError>,
        index: u32,
    ) -> ImageSemaphores {
        let mut pair = semaphores.begin_acquire(create).unwrap();
        semaphores.acquired(index, &mut pair);
        pair
    }

    #[test]
    fn presented_pairs_return_when_the_image_comes_back() {
        let mut create = counter();
        let mut semaphores = SwapchainSemaphores::new(2);

        let pair = acquire(&mut semaphores, &mut create, 0);
        assert!(pair.acquire.is_signaled());
        assert!(!pair.present.is_waited());

        let wait = semaphores.present(0, pair);
        assert_eq!(wait.len(), 1);
        assert_eq!(semaphores.parked_count(), 1);
        assert_eq!(semaphores.free_count(), 0);

        // a different image leaves the parked pair alone
        let other = acquire(&mut semaphores, &mut create, 1);
        assert_eq!(semaphores.parked_count(), 1);
        semaphores.present(1, other);

        let _again = acquire(&mut semaphores, &mut create, 0);
        assert_eq!(semaphores.parked_count(), 1);
        assert_eq!(semaphores.free_count(), 2);
    }

    #[test]
    fn cancelled_acquires_are_reused() {
        let mut create = counter();
        let mut semaphores = SwapchainSemaphores::new(1);
        let pair = semaphores.begin_acquire(&mut create).unwrap();
        let raw = (pair.acquire.raw(), pair.present.raw());
        semaphores.cancel_acquire(pair);
        assert_eq!(semaphores.free_count(), 2);

        let pair = semaphores.begin_acquire(&mut create).unwrap();
        let mut reused = [pair.acquire.raw(), pair.present.raw()];
        reused.sort();
        assert_eq!(reused, [raw.0, raw.1]);
        assert_eq!(pair.acquire.timeline(), 2);
    }

    #[test]
    fn draining_includes_parked_pairs() {
        let mut create = counter();
        let mut semaphores = SwapchainSemaphores::new(1);
        let pair = acquire(&mut semaphores, &mut create, 0);
        semaphores.present(0, pair);
        assert_eq!(semaphores.drain().len(), 2);
        assert_eq!(semaphores.parked_count(), 0);
    }
}
