//! Device queue and command pool checkout.
//!
//! Queues are grouped by family. A caller which finds no free queue either
//! blocks on the pool's condition variable or leaves a waiter which is handed
//! the next released queue.

use {
    crate::{device::CommandPool, RenderError},
    ash::vk,
    bitflags::bitflags,
    std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc, Condvar, Mutex,
        },
        time::{Duration, Instant},
    },
};

bitflags! {
    /// The operations a queue family can perform.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct QueueOperations: u32 {
        const GRAPHICS = 1;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const SPARSE_BINDING = 1 << 3;
        const PRESENT = 1 << 4;
    }
}

impl QueueOperations {
    pub fn from_family(flags: vk::QueueFlags, present: bool) -> Self {
        let mut ops = Self::empty();
        if flags.contains(vk::QueueFlags::GRAPHICS) {
            ops |= Self::GRAPHICS;
        }
        if flags.contains(vk::QueueFlags::COMPUTE) {
            ops |= Self::COMPUTE;
        }
        // graphics and compute queues implicitly support transfers
        if flags.intersects(
            vk::QueueFlags::TRANSFER
                | vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::COMPUTE,
        ) {
            ops |= Self::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::SPARSE_BINDING) {
            ops |= Self::SPARSE_BINDING;
        }
        if present {
            ops |= Self::PRESENT;
        }
        ops
    }
}

/// A checked-out device queue.
#[derive(Debug)]
pub struct DeviceQueue {
    raw: vk::Queue,
    family_index: u32,
    index: u32,
    ops: QueueOperations,
    active_fences: Arc<AtomicU32>,
}

impl DeviceQueue {
    pub fn raw(&self) -> vk::Queue {
        self.raw
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn ops(&self) -> QueueOperations {
        self.ops
    }

    /// Note a submission fence which has not signaled yet.
    pub fn retain_fence(&self) {
        self.active_fences.fetch_add(1, Ordering::AcqRel);
    }

    /// Note that a submission fence has signaled.
    pub fn release_fence(&self) {
        let _ = self.active_fences.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| count.checked_sub(1),
        );
    }

    /// Outstanding submissions across the whole family.
    pub fn active_fences(&self) -> u32 {
        self.active_fences.load(Ordering::Acquire)
    }

    /// A shared counter which outlives the queue checkout.
    pub fn fence_counter(&self) -> Arc<AtomicU32> {
        self.active_fences.clone()
    }
}

/// Who is waiting for a queue.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaiterOwner {
    Frame(u64),
    Loop,
}

type AcquireFn = Box<dyn FnOnce(DeviceQueue) + Send>;
type InvalidateFn = Box<dyn FnOnce() + Send>;

struct QueueWaiter {
    owner: WaiterOwner,
    valid: Arc<AtomicBool>,
    acquire: AcquireFn,
    invalidate: InvalidateFn,
}

/// The family description used to build a [QueuePool].
#[derive(Debug, Clone)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub ops: QueueOperations,
    pub queues: Vec<vk::Queue>,
}

struct QueueFamily {
    index: u32,
    ops: QueueOperations,
    queue_count: usize,
    queues: Vec<DeviceQueue>,
    pools: Vec<CommandPool>,
    waiters: VecDeque<QueueWaiter>,
    sync_waiters: usize,
    active_fences: Arc<AtomicU32>,
}

/// Thread-safe checkout of device queues and transient command pools.
pub struct QueuePool {
    families: Mutex<Vec<QueueFamily>>,
    released: Condvar,
}

// Public API
// ----------

impl QueuePool {
    pub fn new(families: Vec<QueueFamilyInfo>) -> Self {
        let families = families
            .into_iter()
            .map(|info| {
                let active_fences = Arc::new(AtomicU32::new(0));
                let queues = info
                    .queues
                    .iter()
                    .enumerate()
                    .map(|(index, raw)| DeviceQueue {
                        raw: *raw,
                        family_index: info.index,
                        index: index as u32,
                        ops: info.ops,
                        active_fences: active_fences.clone(),
                    })
                    .collect::<Vec<_>>();
                QueueFamily {
                    index: info.index,
                    ops: info.ops,
                    queue_count: queues.len(),
                    queues,
                    pools: Vec::new(),
                    waiters: VecDeque::new(),
                    sync_waiters: 0,
                    active_fences,
                }
            })
            .collect();
        Self {
            families: Mutex::new(families),
            released: Condvar::new(),
        }
    }

    /// The family which supports `ops` with the fewest extra capabilities.
    pub fn family_for(&self, ops: QueueOperations) -> Option<u32> {
        let families = self.families.lock().unwrap();
        Self::find_family(&families, ops).map(|index| families[index].index)
    }

    /// Total queues, free or not, in families supporting `ops`.
    pub fn queue_count(&self, ops: QueueOperations) -> usize {
        self.families
            .lock()
            .unwrap()
            .iter()
            .filter(|family| family.ops.contains(ops))
            .map(|family| family.queue_count)
            .sum()
    }

    /// Outstanding submissions on the family which serves `ops`.
    pub fn active_fences(&self, ops: QueueOperations) -> u32 {
        let families = self.families.lock().unwrap();
        Self::find_family(&families, ops)
            .map(|index| families[index].active_fences.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Hand a queue to a frame as soon as one is free.
    ///
    /// `acquire` may run on the calling thread before this returns. If the
    /// frame's `valid` flag is cleared before a queue frees up, `invalidate`
    /// runs instead. Returns false when no family supports `ops`.
    pub fn acquire_for_frame(
        &self,
        ops: QueueOperations,
        frame: u64,
        valid: Arc<AtomicBool>,
        acquire: impl FnOnce(DeviceQueue) + Send + 'static,
        invalidate: impl FnOnce() + Send + 'static,
    ) -> bool {
        let waiter = QueueWaiter {
            owner: WaiterOwner::Frame(frame),
            valid,
            acquire: Box::new(acquire),
            invalidate: Box::new(invalidate),
        };
        self.acquire_async(ops, waiter)
    }

    /// Hand a queue to the loop as soon as one is free. `invalidate` runs if
    /// the loop stops running first.
    pub fn acquire_for_loop(
        &self,
        ops: QueueOperations,
        running: Arc<AtomicBool>,
        acquire: impl FnOnce(DeviceQueue) + Send + 'static,
        invalidate: impl FnOnce() + Send + 'static,
    ) -> bool {
        let waiter = QueueWaiter {
            owner: WaiterOwner::Loop,
            valid: running,
            acquire: Box::new(acquire),
            invalidate: Box::new(invalidate),
        };
        self.acquire_async(ops, waiter)
    }

    /// Take a free queue, optionally blocking until one is released.
    pub fn try_acquire_queue_sync(
        &self,
        ops: QueueOperations,
        block: bool,
    ) -> Option<DeviceQueue> {
        if block {
            self.acquire_sync(ops, None)
        } else {
            self.acquire_sync(ops, Some(Duration::ZERO))
        }
    }

    /// Take a free queue, waiting at most `timeout` for one to be released.
    pub fn try_acquire_queue_timeout(
        &self,
        ops: QueueOperations,
        timeout: Duration,
    ) -> Option<DeviceQueue> {
        self.acquire_sync(ops, Some(timeout))
    }

    /// Return a queue to its family.
    ///
    /// Blocked synchronous callers are woken first. Otherwise the oldest
    /// valid waiter receives the queue. Waiters which became invalid are
    /// dropped through their invalidate callback.
    pub fn release_queue(&self, queue: DeviceQueue) {
        let mut invalidated = Vec::new();
        let mut handoff = None;
        let queue_for_handoff;
        {
            let mut families = self.families.lock().unwrap();
            let Some(family) = families
                .iter_mut()
                .find(|family| family.index == queue.family_index)
            else {
                log::error!(
                    "Released a queue into unknown family {}",
                    queue.family_index
                );
                return;
            };

            if family.sync_waiters > 0 {
                family.queues.push(queue);
                self.released.notify_all();
                return;
            }

            while let Some(waiter) = family.waiters.pop_front() {
                if waiter.valid.load(Ordering::Acquire) {
                    handoff = Some(waiter.acquire);
                    break;
                }
                log::trace!("Dropping invalid queue waiter {:?}", waiter.owner);
                invalidated.push(waiter.invalidate);
            }
            if handoff.is_none() {
                family.queues.push(queue);
                self.released.notify_all();
                queue_for_handoff = None;
            } else {
                queue_for_handoff = Some(queue);
            }
        }

        for invalidate in invalidated {
            invalidate();
        }
        if let (Some(acquire), Some(queue)) = (handoff, queue_for_handoff) {
            acquire(queue);
        }
    }

    /// Take a command pool for `family_index`, creating one when none are
    /// free.
    pub fn acquire_command_pool(
        &self,
        family_index: u32,
        create: impl FnOnce(u32) -> Result<CommandPool, RenderError>,
    ) -> Result<CommandPool, RenderError> {
        let recycled = self
            .families
            .lock()
            .unwrap()
            .iter_mut()
            .find(|family| family.index == family_index)
            .and_then(|family| family.pools.pop());
        match recycled {
            Some(pool) => Ok(pool),
            None => create(family_index),
        }
    }

    /// Return a command pool. The caller resets it first.
    pub fn release_command_pool(&self, pool: CommandPool) {
        let mut families = self.families.lock().unwrap();
        match families
            .iter_mut()
            .find(|family| family.index == pool.family_index())
        {
            Some(family) => family.pools.push(pool),
            None => log::error!(
                "Released a command pool into unknown family {}",
                pool.family_index()
            ),
        }
    }

    /// Take every pooled command pool, used on shutdown.
    pub fn drain_command_pools(&self) -> Vec<CommandPool> {
        self.families
            .lock()
            .unwrap()
            .iter_mut()
            .flat_map(|family| family.pools.drain(..))
            .collect()
    }

    /// Drop every waiting callback through its invalidate path.
    pub fn invalidate_waiters(&self) {
        let waiters = self
            .families
            .lock()
            .unwrap()
            .iter_mut()
            .flat_map(|family| family.waiters.drain(..))
            .collect::<Vec<_>>();
        for waiter in waiters {
            (waiter.invalidate)();
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.families
            .lock()
            .unwrap()
            .iter()
            .map(|family| family.waiters.len())
            .sum()
    }
}

// Private API
// -----------

impl QueuePool {
    fn find_family(
        families: &[QueueFamily],
        ops: QueueOperations,
    ) -> Option<usize> {
        families
            .iter()
            .enumerate()
            .filter(|(_, family)| {
                family.ops.contains(ops) && family.queue_count > 0
            })
            .min_by_key(|(_, family)| family.ops.bits().count_ones())
            .map(|(index, _)| index)
    }

    fn acquire_async(&self, ops: QueueOperations, waiter: QueueWaiter) -> bool {
        let mut families = self.families.lock().unwrap();
        let Some(index) = Self::find_family(&families, ops) else {
            drop(families);
            log::error!("No queue family supports {:?}", ops);
            (waiter.invalidate)();
            return false;
        };
        let family = &mut families[index];
        let free = if family.waiters.is_empty() {
            family.queues.pop()
        } else {
            None
        };
        match free {
            Some(queue) => {
                drop(families);
                (waiter.acquire)(queue);
            }
            None => family.waiters.push_back(waiter),
        }
        true
    }

    fn acquire_sync(
        &self,
        ops: QueueOperations,
        timeout: Option<Duration>,
    ) -> Option<DeviceQueue> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut families = self.families.lock().unwrap();
        let index = Self::find_family(&families, ops)?;
        if let Some(queue) = families[index].queues.pop() {
            return Some(queue);
        }
        if timeout == Some(Duration::ZERO) {
            return None;
        }

        families[index].sync_waiters += 1;
        let queue = loop {
            if let Some(queue) = families[index].queues.pop() {
                break Some(queue);
            }
            match deadline {
                None => {
                    families = self.released.wait(families).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break None;
                    }
                    families = self
                        .released
                        .wait_timeout(families, deadline - now)
                        .unwrap()
                        .0;
                }
            }
        };
        families[index].sync_waiters -= 1;
        queue
    }
}
