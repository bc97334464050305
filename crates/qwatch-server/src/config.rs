use qwatch_alert::aggregation::AggregatorConfig;
use qwatch_notify::manager::ChannelConfig;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Scope of the rules this process evaluates.
    #[serde(default = "default_host_id")]
    pub host_id: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_database_file")]
    pub database_file: String,
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    /// Closed alerts older than this are pruned.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Whether this replica writes alerts and sends notifications. Every
    /// replica evaluates.
    #[serde(default = "default_has_lock")]
    pub has_lock: bool,
    #[serde(default = "default_history_retention_ms")]
    pub history_retention_ms: i64,
    /// Snowflake node id; replicas sharing a database need distinct values.
    #[serde(default = "default_node_id")]
    pub node_id: i32,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    pub id: String,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

fn default_host_id() -> String {
    "default".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_database_file() -> String {
    "alerts.db".to_string()
}

fn default_snapshot_interval_ms() -> u64 {
    5000
}

fn default_retention_days() -> u32 {
    7
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_has_lock() -> bool {
    true
}

fn default_history_retention_ms() -> i64 {
    60 * 60 * 1000
}

fn default_node_id() -> i32 {
    1
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{}': {}", path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.snapshot_interval_ms == 0 {
            anyhow::bail!("snapshot_interval_ms must be greater than 0");
        }
        if config.cleanup_interval_secs == 0 {
            anyhow::bail!("cleanup_interval_secs must be greater than 0");
        }
        if !(0..=31).contains(&config.node_id) {
            anyhow::bail!("node_id must be within 0..=31");
        }
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.database_file)
    }

    pub fn retention_ms(&self) -> i64 {
        i64::from(self.retention_days) * 24 * 60 * 60 * 1000
    }
}
