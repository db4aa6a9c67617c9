//! Sliding window event counters.

use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Counts events over a trailing time window.
///
/// Events are grouped into buckets of `window / RESOLUTION`, so memory stays bounded however
/// many events are recorded. Counts are accurate to within one bucket.
///
/// Bucket boundaries are fixed relative to `origin`. Counters sharing an origin put events seen
/// at the same instant into the same bucket, and expire them together.
#[derive(Debug)]
pub(crate) struct RateCounter {
    window: Duration,
    origin: Instant,
    bucket_width: Duration,

    /// Bucket indices since `origin`, and counts, oldest first.
    buckets: VecDeque<(u128, u64)>,
}

impl RateCounter {
    const RESOLUTION: u32 = 20;

    pub(crate) fn new(window: Duration, origin: Instant) -> Self {
        assert!(!window.is_zero(), "window must be non-zero");
        Self {
            window,
            origin,
            bucket_width: (window / Self::RESOLUTION).max(Duration::from_nanos(1)),
            buckets: VecDeque::with_capacity(Self::RESOLUTION as usize),
        }
    }

    pub(crate) fn incr(&mut self) {
        let index = self.bucket_index(Instant::now());
        self.expire(index);

        match self.buckets.back_mut() {
            Some((last, count)) if *last == index => *count += 1,
            _ => self.buckets.push_back((index, 1)),
        }
    }

    /// Events seen within the window.
    pub(crate) fn count(&mut self) -> u64 {
        self.expire(self.bucket_index(Instant::now()));
        self.buckets.iter().map(|(_, count)| count).sum()
    }

    pub(crate) fn window(&self) -> Duration {
        self.window
    }

    fn bucket_index(&self, now: Instant) -> u128 {
        now.saturating_duration_since(self.origin).as_nanos() / self.bucket_width.as_nanos()
    }

    fn expire(&mut self, current: u128) {
        while let Some((index, _)) = self.buckets.front() {
            if current - index >= u128::from(Self::RESOLUTION) {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}
