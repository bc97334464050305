use std::collections::HashMap;

use qwatch_common::types::{now_millis, Timestamp};

use super::window::BucketRing;

/// Integer counters per key over a rolling time window, e.g. failures and
/// successes seen in the last minute.
///
/// ```
/// use qwatch_alert::aggregation::SlidingWindowCounter;
///
/// let mut counter = SlidingWindowCounter::new(5000, 1000);
/// counter.incr_at("failure", 2, 0);
/// counter.incr_at("failure", 1, 1500);
/// assert_eq!(counter.get_at("failure", 1500), 3);
/// assert_eq!(counter.get_at("failure", 60_000), 0);
/// ```
pub struct SlidingWindowCounter {
    ring: BucketRing<HashMap<String, u64>>,
}

impl SlidingWindowCounter {
    pub fn new(window_ms: i64, granularity_ms: i64) -> Self {
        Self {
            ring: BucketRing::new(window_ms, granularity_ms, HashMap::new()),
        }
    }

    pub fn window(&self) -> i64 {
        self.ring.window()
    }

    pub fn bucket_count(&self) -> usize {
        self.ring.bucket_count()
    }

    /// Adds `n` to `key` in the bucket covering `ts`. Returns the new
    /// windowed total, or the unchanged total when `ts` predates the window.
    pub fn incr_at(&mut self, key: &str, n: u64, ts: Timestamp) -> u64 {
        if let Some(bucket) = self.ring.bucket_mut(ts) {
            *bucket.entry(key.to_string()).or_insert(0) += n;
        }
        self.get_at(key, ts)
    }

    /// Windowed total for `key` as of `ts`.
    pub fn get_at(&self, key: &str, ts: Timestamp) -> u64 {
        self.ring
            .live_at(Some(ts))
            .filter_map(|bucket| bucket.get(key))
            .sum()
    }

    /// Totals of every key still inside the window as of `ts`.
    pub fn totals_at(&self, ts: Timestamp) -> HashMap<String, u64> {
        let mut totals = HashMap::new();
        for bucket in self.ring.live_at(Some(ts)) {
            for (key, n) in bucket {
                *totals.entry(key.clone()).or_insert(0) += n;
            }
        }
        totals
    }

    pub fn incr(&mut self, key: &str, n: u64) -> u64 {
        self.incr_at(key, n, now_millis())
    }

    pub fn get(&self, key: &str) -> u64 {
        self.get_at(key, now_millis())
    }

    pub fn reset(&mut self) {
        self.ring.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_drop_to_zero_after_window() {
        let mut counter = SlidingWindowCounter::new(5000, 1000);
        for _ in 0..10 {
            counter.incr_at("failure", 1, 100);
        }
        assert_eq!(counter.get_at("failure", 4999), 10);
        assert_eq!(counter.get_at("failure", 5000), 0);
        assert_eq!(counter.get_at("failure", 100_000), 0);
    }

    #[test]
    fn seven_tick_trace_totals() {
        let mut counter = SlidingWindowCounter::new(5000, 1000);
        assert_eq!(counter.bucket_count(), 5);
        for tick in 0..7u64 {
            let ts = tick as i64 * 1000;
            for _ in 0..tick {
                counter.incr_at("failure", 1, ts);
            }
            for _ in 0..tick * 2 {
                counter.incr_at("success", 1, ts);
            }
        }
        assert_eq!(counter.get_at("failure", 6000), 20);
        assert_eq!(counter.get_at("success", 6000), 40);

        let totals = counter.totals_at(6000);
        assert_eq!(totals.get("failure"), Some(&20));
        assert_eq!(totals.get("success"), Some(&40));
    }

    #[test]
    fn unknown_key_is_zero() {
        let mut counter = SlidingWindowCounter::new(2000, 1000);
        counter.incr_at("a", 3, 0);
        assert_eq!(counter.get_at("b", 0), 0);
        counter.reset();
        assert_eq!(counter.get_at("a", 0), 0);
    }
}
