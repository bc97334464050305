use qwatch_alert::{AlertError, RuleManager};
use qwatch_common::types::MetricSample;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub unknown_metric: u64,
    pub malformed: u64,
}

/// Parses one JSON-lines record. Blank lines and `#` comments yield `None`.
pub fn parse_sample(line: &str) -> serde_json::Result<Option<MetricSample>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Feeds `MetricSample` JSON lines from `reader` into the manager until EOF.
pub async fn run_ingest<R>(reader: R, manager: &RuleManager) -> std::io::Result<IngestStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = IngestStats::default();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let sample = match parse_sample(&line) {
            Ok(Some(sample)) => sample,
            Ok(None) => continue,
            Err(e) => {
                stats.malformed += 1;
                tracing::warn!(error = %e, "Skipping malformed sample");
                continue;
            }
        };
        match manager.ingest(&sample) {
            Ok(_) => stats.accepted += 1,
            Err(AlertError::MetricNotFound(metric_id)) => {
                stats.unknown_metric += 1;
                tracing::debug!(metric_id = %metric_id, "Sample for unregistered metric dropped");
            }
            Err(e) => {
                stats.malformed += 1;
                tracing::warn!(metric_id = %sample.metric_id, error = %e, "Sample rejected");
            }
        }
    }
    Ok(stats)
}
