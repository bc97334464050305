use std::collections::{HashMap, VecDeque};

use qwatch_common::types::{MetricSample, Timestamp};

/// Raw per-metric sample history with time-based retention. Peak
/// conditions re-derive their lookback windows from it on every tick, which
/// also reads `depth` samples from before the retention horizon.
pub struct MetricHistory {
    retention_ms: i64,
    depth: usize,
    series: HashMap<String, VecDeque<(Timestamp, f64)>>,
}

impl MetricHistory {
    pub fn new(retention_ms: i64) -> Self {
        Self {
            retention_ms: retention_ms.max(0),
            depth: 0,
            series: HashMap::new(),
        }
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    /// Widens retention; never shrinks it.
    pub fn ensure_retention(&mut self, retention_ms: i64) {
        self.retention_ms = self.retention_ms.max(retention_ms);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Keeps at least `depth` samples older than the retention horizon;
    /// never shrinks.
    pub fn ensure_depth(&mut self, depth: usize) {
        self.depth = self.depth.max(depth);
    }

    /// Inserts a sample keeping the series ordered by timestamp, then
    /// evicts samples older than the retention horizon.
    pub fn push(&mut self, sample: &MetricSample) {
        let data = self.series.entry(sample.metric_id.clone()).or_default();
        let point = (sample.timestamp, sample.value);
        match data.back() {
            Some(&(last, _)) if last > sample.timestamp => {
                let pos = data.partition_point(|&(ts, _)| ts <= sample.timestamp);
                data.insert(pos, point);
            }
            _ => data.push_back(point),
        }
        let newest = data.back().map(|&(ts, _)| ts).unwrap_or(sample.timestamp);
        Self::evict(data, newest - self.retention_ms, self.depth);
    }

    fn evict(data: &mut VecDeque<(Timestamp, f64)>, cutoff: Timestamp, depth: usize) {
        let expired = data.partition_point(|&(ts, _)| ts < cutoff);
        data.drain(..expired.saturating_sub(depth));
    }

    /// Samples with `from < ts <= to`, oldest first.
    pub fn range(&self, metric_id: &str, from: Timestamp, to: Timestamp) -> Vec<(Timestamp, f64)> {
        self.series
            .get(metric_id)
            .map(|data| {
                data.iter()
                    .filter(|&&(ts, _)| ts > from && ts <= to)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The last `n` samples with `ts <= at`, oldest first.
    pub fn preceding(&self, metric_id: &str, at: Timestamp, n: usize) -> Vec<(Timestamp, f64)> {
        let Some(data) = self.series.get(metric_id) else {
            return Vec::new();
        };
        let end = data.partition_point(|&(ts, _)| ts <= at);
        let start = end.saturating_sub(n);
        data.range(start..end).copied().collect()
    }

    pub fn len(&self, metric_id: &str) -> usize {
        self.series.get(metric_id).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(VecDeque::is_empty)
    }

    pub fn remove(&mut self, metric_id: &str) {
        self.series.remove(metric_id);
    }
}
