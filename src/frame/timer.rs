use std::time::Duration;

/// Identifies a scheduled timer so it can be cancelled.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TimerId(u64);

type TimerFn = Box<dyn FnMut(Duration) -> bool + Send>;

enum TimerKind {
    /// Fires on every update until the callback returns true.
    OneShot,

    /// Fires every `interval`. Time past the deadline carries into the next
    /// period.
    Interval { interval: Duration, elapsed: Duration },
}

struct Timer {
    id: TimerId,
    kind: TimerKind,
    callback: TimerFn,
}

/// Timers fired by the loop on each update.
#[derive(Default)]
pub struct Timers {
    next_id: u64,
    timers: Vec<Timer>,
}

impl Timers {
    /// Call `callback` with the update delta on every update until it
    /// returns true.
    pub fn schedule(
        &mut self,
        callback: impl FnMut(Duration) -> bool + Send + 'static,
    ) -> TimerId {
        self.add(TimerKind::OneShot, Box::new(callback))
    }

    /// Call `callback` once per `interval` until it returns true.
    pub fn schedule_interval(
        &mut self,
        interval: Duration,
        callback: impl FnMut(Duration) -> bool + Send + 'static,
    ) -> TimerId {
        self.add(
            TimerKind::Interval {
                interval,
                elapsed: Duration::ZERO,
            },
            Box::new(callback),
        )
    }

    /// Returns false when the timer was already removed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|timer| timer.id != id);
        before != self.timers.len()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// The time until the next interval timer is due, if any.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers
            .iter()
            .filter_map(|timer| match timer.kind {
                TimerKind::Interval { interval, elapsed } => {
                    Some(interval.saturating_sub(elapsed))
                }
                TimerKind::OneShot => None,
            })
            .min()
    }

    /// Advance every timer by `delta` and fire the ones which are due.
    /// Returns the number of callbacks invoked.
    pub fn advance(&mut self, delta: Duration) -> usize {
        let mut fired = 0;
        self.timers.retain_mut(|timer| match &mut timer.kind {
            TimerKind::OneShot => {
                fired += 1;
                !(timer.callback)(delta)
            }
            TimerKind::Interval { interval, elapsed } => {
                *elapsed += delta;
                if *elapsed < *interval {
                    return true;
                }
                let period = *elapsed;
                // fire once, the residual keeps the long-run rate
                *elapsed = (*elapsed - *interval).min(*interval);
                fired += 1;
                !(timer.callback)(period)
            }
        });
        fired
    }
}

impl Timers {
    fn add(&mut self, kind: TimerKind, callback: TimerFn) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.timers.push(Timer { id, kind, callback });
        id
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        pretty_assertions::assert_eq,
        std::sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let read = {
            let count = count.clone();
            move || count.load(Ordering::SeqCst)
        };
        (count, read)
    }

    #[test]
    fn interval_timers_carry_residual_time() {
        let mut timers = Timers::default();
        let (count, fired) = counter();
        timers.schedule_interval(Duration::from_millis(10), move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            false
        });

        timers.advance(Duration::from_millis(6));
        assert_eq!(fired(), 0);
        timers.advance(Duration::from_millis(6));
        assert_eq!(fired(), 1);
        assert_eq!(timers.next_deadline(), Some(Duration::from_millis(8)));

        // the 2ms residual makes this update reach the next deadline
        timers.advance(Duration::from_millis(8));
        assert_eq!(fired(), 2);
    }

    #[test]
    fn one_shot_timers_run_until_done() {
        let mut timers = Timers::default();
        let (count, fired) = counter();
        timers.schedule(move |_| count.fetch_add(1, Ordering::SeqCst) == 2);

        for _ in 0..5 {
            timers.advance(Duration::from_millis(1));
        }
        assert_eq!(fired(), 3);
        assert!(timers.is_empty());
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let mut timers = Timers::default();
        let (count, fired) = counter();
        let id = timers.schedule(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            false
        });
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        timers.advance(Duration::from_secs(1));
        assert_eq!(fired(), 0);
    }
}
