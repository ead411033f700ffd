use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Frame intervals kept for the average.
pub const CADENCE_WINDOW: usize = 16;

/// Tracks when frames start and how long the recent ones took.
#[derive(Debug, Clone)]
pub struct FrameCadence {
    budget: Duration,
    intervals: VecDeque<Duration>,
    last_start: Option<Instant>,
}

impl FrameCadence {
    /// `budget` is the target time between two frames.
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            intervals: VecDeque::with_capacity(CADENCE_WINDOW),
            last_start: None,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn set_budget(&mut self, budget: Duration) {
        self.budget = budget;
    }

    pub fn last_start(&self) -> Option<Instant> {
        self.last_start
    }

    /// Record the start of a frame.
    pub fn frame_started(&mut self, now: Instant) {
        if let Some(last) = self.last_start {
            if self.intervals.len() == CADENCE_WINDOW {
                self.intervals.pop_front();
            }
            self.intervals.push_back(now.saturating_duration_since(last));
        }
        self.last_start = Some(now);
    }

    /// The average interval between recent frames, or the budget before
    /// any were recorded.
    pub fn average(&self) -> Duration {
        if self.intervals.is_empty() {
            return self.budget;
        }
        self.intervals.iter().sum::<Duration>() / self.intervals.len() as u32
    }

    /// When the next frame is due.
    pub fn next_deadline(&self, now: Instant) -> Instant {
        self.last_start.map_or(now, |last| last + self.budget)
    }

    /// The extra delay which brings frames back in step once the current
    /// frame window ran over the budget: the overshoot minus the average
    /// frame time.
    pub fn flatten_delay(&self, now: Instant) -> Duration {
        let Some(last) = self.last_start else {
            return Duration::ZERO;
        };
        let window = now.saturating_duration_since(last);
        if window <= self.budget {
            return Duration::ZERO;
        }
        (window - self.budget).saturating_sub(self.average())
    }

    pub fn reset(&mut self) {
        self.intervals.clear();
        self.last_start = None;
    }
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq};

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn average_of_recent_intervals() {
        let start = Instant::now();
        let mut cadence = FrameCadence::new(16 * MS);
        assert_eq!(cadence.average(), 16 * MS);

        cadence.frame_started(start);
        cadence.frame_started(start + 10 * MS);
        cadence.frame_started(start + 30 * MS);
        assert_eq!(cadence.average(), 15 * MS);
    }

    #[test]
    fn window_is_bounded() {
        let start = Instant::now();
        let mut cadence = FrameCadence::new(16 * MS);
        cadence.frame_started(start);
        for frame in 1..=CADENCE_WINDOW as u32 {
            cadence.frame_started(start + frame * 100 * MS);
        }
        let last = start + CADENCE_WINDOW as u32 * 100 * MS;
        for frame in 1..=CADENCE_WINDOW as u32 {
            cadence.frame_started(last + frame * 10 * MS);
        }
        assert_eq!(cadence.average(), 10 * MS);
    }

    #[test]
    fn overshoot_is_flattened() {
        let start = Instant::now();
        let mut cadence = FrameCadence::new(10 * MS);
        cadence.frame_started(start);
        cadence.frame_started(start + 4 * MS);
        cadence.frame_started(start + 8 * MS);

        // within budget
        assert_eq!(cadence.flatten_delay(start + 15 * MS), Duration::ZERO);

        // 20ms window, 10ms over budget, 4ms average
        assert_eq!(cadence.flatten_delay(start + 28 * MS), 6 * MS);
        assert_eq!(cadence.next_deadline(start), start + 18 * MS);
    }
}
