use {
    crate::RenderError,
    ash::vk::{self, Handle},
    std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Mutex,
        },
    },
};

/// The subset of device calls which drive fences.
///
/// The loop only ever talks to fences through this trait so it can run
/// against [FakeFenceDevice] in tests.
pub trait FenceDevice: Send + Sync {
    fn create_fence(&self) -> Result<vk::Fence, RenderError>;

    /// # Safety
    ///
    /// Unsafe because the fence must not be pending.
    unsafe fn destroy_fence(&self, fence: vk::Fence);

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), RenderError>;

    /// Returns true when the fence is signaled.
    fn fence_status(&self, fence: vk::Fence) -> Result<bool, RenderError>;

    /// Block until the fence is signaled or the timeout (in nanoseconds)
    /// elapses. Returns true when the fence is signaled.
    fn wait_for_fence(
        &self,
        fence: vk::Fence,
        timeout: u64,
    ) -> Result<bool, RenderError>;

    fn device_wait_idle(&self) -> Result<(), RenderError>;
}

impl FenceDevice for ash::Device {
    fn create_fence(&self) -> Result<vk::Fence, RenderError> {
        let fence = unsafe {
            let create_info = vk::FenceCreateInfo::default();
            ash::Device::create_fence(self, &create_info, None)?
        };
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        ash::Device::destroy_fence(self, fence, None)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), RenderError> {
        unsafe { self.reset_fences(&[fence])? };
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool, RenderError> {
        Ok(unsafe { self.get_fence_status(fence)? })
    }

    fn wait_for_fence(
        &self,
        fence: vk::Fence,
        timeout: u64,
    ) -> Result<bool, RenderError> {
        match unsafe { self.wait_for_fences(&[fence], true, timeout) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn device_wait_idle(&self) -> Result<(), RenderError> {
        unsafe { ash::Device::device_wait_idle(self)? };
        Ok(())
    }
}

/// A fence device which keeps fence state on the host.
///
/// Fences only signal when a test calls [FakeFenceDevice::signal] or
/// [FakeFenceDevice::signal_all]. Blocking waits signal the fence
/// immediately, as the device would eventually.
#[derive(Default)]
pub struct FakeFenceDevice {
    next_handle: AtomicU64,
    live: Mutex<HashSet<u64>>,
    signaled: Mutex<HashSet<u64>>,
    lost: AtomicBool,
    pub wait_idle_calls: AtomicU64,
}

impl FakeFenceDevice {
    pub fn signal(&self, fence: vk::Fence) {
        self.signaled.lock().unwrap().insert(fence.as_raw());
    }

    /// Signal every fence which currently exists.
    pub fn signal_all(&self) {
        let live = self.live.lock().unwrap().clone();
        self.signaled.lock().unwrap().extend(live);
    }

    /// Every fence query fails with DeviceLost from now on.
    pub fn lose_device(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }

    pub fn live_fences(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn check_lost(&self) -> Result<(), RenderError> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(RenderError::DeviceLost);
        }
        Ok(())
    }
}

impl FenceDevice for FakeFenceDevice {
    fn create_fence(&self) -> Result<vk::Fence, RenderError> {
        let raw = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.live.lock().unwrap().insert(raw);
        Ok(vk::Fence::from_raw(raw))
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.live.lock().unwrap().remove(&fence.as_raw());
        self.signaled.lock().unwrap().remove(&fence.as_raw());
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), RenderError> {
        self.signaled.lock().unwrap().remove(&fence.as_raw());
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool, RenderError> {
        self.check_lost()?;
        Ok(self.signaled.lock().unwrap().contains(&fence.as_raw()))
    }

    fn wait_for_fence(
        &self,
        fence: vk::Fence,
        _timeout: u64,
    ) -> Result<bool, RenderError> {
        self.check_lost()?;
        self.signal(fence);
        Ok(true)
    }

    fn device_wait_idle(&self) -> Result<(), RenderError> {
        self.check_lost()?;
        self.wait_idle_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The lifecycle of a [Fence].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FenceState {
    /// Not submitted. Release callbacks may be added.
    Disabled,

    /// Submitted and pending on the device.
    Armed,

    /// The device signaled the fence and every release callback ran.
    Signaled,
}

type ReleaseFn = Box<dyn FnOnce(bool) + Send>;

/// A Vulkan fence with an ordered list of release callbacks.
///
/// Callbacks run in the order they were added, exactly once, with `true`
/// when the fence signaled normally.
pub struct Fence {
    raw: vk::Fence,
    state: FenceState,
    release: Vec<(String, ReleaseFn)>,
}

impl Fence {
    pub fn new(raw: vk::Fence) -> Self {
        Self {
            raw,
            state: FenceState::Disabled,
            release: Vec::new(),
        }
    }

    pub fn raw(&self) -> vk::Fence {
        self.raw
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    /// Tags of the pending release callbacks, oldest first.
    pub fn release_tags(&self) -> Vec<&str> {
        self.release.iter().map(|(tag, _)| tag.as_str()).collect()
    }

    /// Add a callback which runs when the fence signals.
    ///
    /// Adding a callback to a fence which already signaled is an error: the
    /// callback still runs, immediately, with `false`.
    pub fn add_release(
        &mut self,
        tag: impl Into<String>,
        callback: impl FnOnce(bool) + Send + 'static,
    ) -> Result<(), RenderError> {
        let tag = tag.into();
        if self.state == FenceState::Signaled {
            log::warn!("Release '{}' scheduled on a signaled fence", tag);
            callback(false);
            return Err(RenderError::FenceScheduleAfterFinalize);
        }
        self.release.push((tag, Box::new(callback)));
        Ok(())
    }

    /// Mark the fence as submitted.
    pub fn arm(&mut self) {
        debug_assert_eq!(self.state, FenceState::Disabled);
        self.state = FenceState::Armed;
    }

    /// Poll the fence, or block on it when `wait` is set. Runs the release
    /// callbacks and returns true once the fence signals.
    ///
    /// Device errors run the callbacks with `false` before being returned.
    pub fn check(
        &mut self,
        device: &dyn FenceDevice,
        wait: bool,
    ) -> Result<bool, RenderError> {
        match self.state {
            FenceState::Signaled => return Ok(true),
            FenceState::Disabled => return Ok(false),
            FenceState::Armed => (),
        }
        let status = if wait {
            device.wait_for_fence(self.raw, u64::MAX)
        } else {
            device.fence_status(self.raw)
        };
        match status {
            Ok(true) => {
                self.state = FenceState::Signaled;
                self.run_release(true);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                log::error!("Fence {:?} failed: {}", self.raw, err);
                self.state = FenceState::Signaled;
                self.run_release(false);
                Err(err)
            }
        }
    }

    /// Run every pending release callback with `false` without waiting on
    /// the device.
    pub fn cancel(&mut self) {
        self.run_release(false);
    }

    /// Return a signaled fence to the disabled state so it can be reused.
    pub fn reset(
        &mut self,
        device: &dyn FenceDevice,
    ) -> Result<(), RenderError> {
        if self.state == FenceState::Signaled {
            device.reset_fence(self.raw)?;
        }
        self.state = FenceState::Disabled;
        Ok(())
    }

    fn run_release(&mut self, success: bool) {
        for (tag, callback) in self.release.drain(..) {
            log::trace!("Fence {:?} release '{}' ({})", self.raw, tag, success);
            callback(success);
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if !self.release.is_empty() {
            log::warn!(
                "Fence {:?} dropped with pending releases {:?}",
                self.raw,
                self.release_tags()
            );
            self.run_release(false);
        }
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("raw", &self.raw)
            .field("state", &self.state)
            .field("release", &self.release_tags())
            .finish()
    }
}

/// A binary semaphore plus the bookkeeping needed to reuse it safely.
#[derive(Debug)]
pub struct Semaphore {
    raw: vk::Semaphore,
    waited: bool,
    signaled: bool,
    in_use: bool,
    timeline: u64,
}

impl Semaphore {
    pub fn new(raw: vk::Semaphore) -> Self {
        Self {
            raw,
            waited: true,
            signaled: false,
            in_use: false,
            timeline: 0,
        }
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }

    pub fn is_waited(&self) -> bool {
        self.waited
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    /// The number of times the semaphore has been handed out.
    pub fn timeline(&self) -> u64 {
        self.timeline
    }

    /// A submission will signal the semaphore.
    pub fn set_signaled(&mut self) {
        self.signaled = true;
        self.waited = false;
        self.in_use = true;
    }

    /// A submission will wait on the semaphore.
    pub fn set_waited(&mut self) {
        self.waited = true;
    }

    /// The device no longer references the semaphore.
    pub fn set_released(&mut self) {
        self.in_use = false;
    }

    pub fn is_reusable(&self) -> bool {
        !self.in_use && self.waited
    }

    fn begin_use(&mut self) {
        self.signaled = false;
        self.timeline += 1;
    }
}

/// Recycles semaphores which are no longer referenced by the device.
#[derive(Debug, Default)]
pub struct SemaphorePool {
    free: Vec<Semaphore>,
}

impl SemaphorePool {
    /// Take a reusable semaphore, or create one with `create`.
    pub fn acquire(
        &mut self,
        create: impl FnOnce() -> Result<vk::Semaphore, RenderError>,
    ) -> Result<Semaphore, RenderError> {
        let position = self.free.iter().position(Semaphore::is_reusable);
        let mut semaphore = match position {
            Some(index) => self.free.swap_remove(index),
            None => Semaphore::new(create()?),
        };
        semaphore.begin_use();
        Ok(semaphore)
    }

    pub fn release(&mut self, semaphore: Semaphore) {
        self.free.push(semaphore);
    }

    /// Move every semaphore into `other`. Used when a swapchain is
    /// replaced.
    pub fn migrate_into(&mut self, other: &mut SemaphorePool) {
        other.free.append(&mut self.free);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Remove every semaphore, reusable or not, for destruction.
    pub fn drain(&mut self) -> Vec<Semaphore> {
        std::mem::take(&mut self.free)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        pretty_assertions::assert_eq,
        std::sync::{Arc, Mutex},
    };

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> ReleaseFn) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |name: &str| -> ReleaseFn {
            let log = log_clone.clone();
            let name = name.to_owned();
            Box::new(move |success| {
                log.lock().unwrap().push(format!("{}:{}", name, success))
            })
        };
        (log, make)
    }

    #[test]
    fn releases_run_in_order_once_signaled() {
        let device = FakeFenceDevice::default();
        let (log, make) = recorder();
        let mut fence = Fence::new(device.create_fence().unwrap());
        fence.add_release("a", make("a")).unwrap();
        fence.add_release("b", make("b")).unwrap();
        fence.arm();

        assert!(!fence.check(&device, false).unwrap());
        assert!(log.lock().unwrap().is_empty());

        device.signal(fence.raw());
        assert!(fence.check(&device, false).unwrap());
        assert_eq!(fence.state(), FenceState::Signaled);
        assert_eq!(*log.lock().unwrap(), vec!["a:true", "b:true"]);

        fence.reset(&device).unwrap();
        assert_eq!(fence.state(), FenceState::Disabled);
        assert!(!device.fence_status(fence.raw()).unwrap());
    }

    #[test]
    fn release_after_signal_fails() {
        let device = FakeFenceDevice::default();
        let (log, make) = recorder();
        let mut fence = Fence::new(device.create_fence().unwrap());
        fence.arm();
        assert!(fence.check(&device, true).unwrap());

        let result = fence.add_release("late", make("late"));
        assert!(matches!(
            result,
            Err(RenderError::FenceScheduleAfterFinalize)
        ));
        assert_eq!(*log.lock().unwrap(), vec!["late:false"]);
    }

    #[test]
    fn device_lost_releases_with_failure() {
        let device = FakeFenceDevice::default();
        let (log, make) = recorder();
        let mut fence = Fence::new(device.create_fence().unwrap());
        fence.add_release("frame", make("frame")).unwrap();
        fence.arm();
        device.lose_device();
        assert!(matches!(
            fence.check(&device, false),
            Err(RenderError::DeviceLost)
        ));
        assert_eq!(*log.lock().unwrap(), vec!["frame:false"]);
    }

    #[test]
    fn semaphores_are_reused_only_after_wait() {
        let mut pool = SemaphorePool::default();
        let mut created = 0;
        let mut create = || {
            created += 1;
            Ok(vk::Semaphore::from_raw(created))
        };

        let mut first = pool.acquire(&mut create).unwrap();
        first.set_signaled();
        first.set_released();
        pool.release(first);

        // Signaled but never waited on.
        let second = pool.acquire(&mut create).unwrap();
        assert_eq!(second.raw(), vk::Semaphore::from_raw(2));

        let mut first = pool.free.pop().unwrap();
        first.set_waited();
        pool.release(first);
        let reused = pool.acquire(&mut create).unwrap();
        assert_eq!(reused.raw(), vk::Semaphore::from_raw(1));
        assert_eq!(reused.timeline(), 2);
    }
}
