//! Smoothed z-score peak detection.
//!
//! The detector keeps the last `lag` filtered samples. A new sample is a
//! peak when it lies more than `deviations` standard deviations from the
//! mean of that window. Peaks are folded back into the window damped by
//! `influence` so a burst does not drag the baseline along with it.

use std::collections::VecDeque;

use qwatch_common::types::Timestamp;

/// Streaming z-score detector. Single writer; samples older than the last
/// accepted one are ignored.
///
/// ```
/// use qwatch_alert::stats::PeakDetector;
///
/// let mut detector = PeakDetector::new(3, 2.0, 0.0);
/// for (ts, v) in [(1, 1.0), (2, 1.1), (3, 0.9)] {
///     assert!(detector.is_in_lag_period());
///     assert_eq!(detector.update(v, ts), 0);
/// }
/// assert!(!detector.is_in_lag_period());
/// assert_eq!(detector.update(10.0, 4), 1);
/// assert_eq!(detector.update(1.0, 5), 0);
/// ```
#[derive(Debug, Clone)]
pub struct PeakDetector {
    lag: usize,
    deviations: f64,
    influence: f64,
    filtered: VecDeque<f64>,
    last_timestamp: Option<Timestamp>,
}

impl PeakDetector {
    pub fn new(lag: usize, deviations: f64, influence: f64) -> Self {
        let lag = lag.max(1);
        Self {
            lag,
            deviations,
            influence: influence.clamp(0.0, 1.0),
            filtered: VecDeque::with_capacity(lag + 1),
            last_timestamp: None,
        }
    }

    pub fn lag(&self) -> usize {
        self.lag
    }

    pub fn deviations(&self) -> f64 {
        self.deviations
    }

    pub fn influence(&self) -> f64 {
        self.influence
    }

    /// Timestamp of the last sample folded into the window.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.last_timestamp
    }

    /// True until `lag` samples have been seen.
    pub fn is_in_lag_period(&self) -> bool {
        self.filtered.len() < self.lag
    }

    /// Feeds one sample taken at `timestamp`. Returns `1` for a peak above
    /// the baseline, `-1` below it, `0` otherwise (always `0` during the lag
    /// period and for out-of-order samples, which leave the window as is).
    pub fn update(&mut self, value: f64, timestamp: Timestamp) -> i8 {
        if self.last_timestamp.is_some_and(|last| timestamp < last) {
            return 0;
        }
        self.last_timestamp = Some(timestamp);
        if self.is_in_lag_period() {
            self.filtered.push_back(value);
            return 0;
        }

        let (mean, std_dev) = self.baseline();
        let (signal, folded) = if (value - mean).abs() > self.deviations * std_dev {
            let previous = self.filtered.back().copied().unwrap_or(value);
            let signal = if value > mean { 1 } else { -1 };
            (
                signal,
                self.influence * value + (1.0 - self.influence) * previous,
            )
        } else {
            (0, value)
        };

        self.filtered.push_back(folded);
        while self.filtered.len() > self.lag {
            self.filtered.pop_front();
        }
        signal
    }

    /// Mean and population standard deviation of the filtered window.
    pub fn baseline(&self) -> (f64, f64) {
        let n = self.filtered.len();
        if n == 0 {
            return (0.0, 0.0);
        }
        let mean = self.filtered.iter().sum::<f64>() / n as f64;
        let variance = self
            .filtered
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n as f64;
        (mean, variance.sqrt())
    }

    pub fn reset(&mut self) {
        self.filtered.clear();
        self.last_timestamp = None;
    }
}
