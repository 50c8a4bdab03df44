use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Seconds between two recording cycles
    #[serde(default = "default_record_interval_secs")]
    pub record_interval_secs: u64,

    /// Upper bound for a single node's stats call
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Path of the stats endpoint exposed by every node
    #[serde(default = "default_node_stats_path")]
    pub node_stats_path: String,

    /// Data limit percentages that raise a usage alert when crossed
    #[serde(default = "default_usage_thresholds")]
    pub usage_thresholds: Vec<u8>,

    #[serde(default)]
    pub console_port: Option<u16>,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log directory for file-based logging, stdout when absent
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default = "default_log_file")]
    pub log_file: String,
}

fn default_database_url() -> String {
    "sqlite:data/recorder.db?mode=rwc".to_string()
}

fn default_record_interval_secs() -> u64 {
    30
}

fn default_node_timeout_secs() -> u64 {
    10
}

fn default_node_stats_path() -> String {
    "/users/stats".to_string()
}

fn default_usage_thresholds() -> Vec<u8> {
    vec![80, 90, 100]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "recorder.log".to_string()
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            record_interval_secs: default_record_interval_secs(),
            node_timeout_secs: default_node_timeout_secs(),
            node_stats_path: default_node_stats_path(),
            usage_thresholds: default_usage_thresholds(),
            console_port: None,
            log_level: default_log_level(),
            log_dir: None,
            log_file: default_log_file(),
        }
    }
}

impl RecorderConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: RecorderConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.record_interval_secs == 0 {
            anyhow::bail!("record_interval_secs must be greater than zero");
        }
        if self.node_timeout_secs == 0 {
            anyhow::bail!("node_timeout_secs must be greater than zero");
        }
        if !self.node_stats_path.starts_with('/') {
            anyhow::bail!(
                "node_stats_path must start with '/': {}",
                self.node_stats_path
            );
        }
        Ok(())
    }

    pub fn record_interval(&self) -> Duration {
        Duration::from_secs(self.record_interval_secs)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}
