//! Configuration file handling for sl-watch

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sl_stream::{ClientConfig, StreamQuery};
use std::path::Path;

/// Configuration for the watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Stream client settings
    #[serde(default)]
    pub client: ClientConfig,
    /// Subscriptions to open at startup
    #[serde(default = "default_streams")]
    pub streams: Vec<StreamQuery>,
    /// Simulated server driving the demo
    #[serde(default)]
    pub demo: DemoConfig,
}

/// Simulated table and the churn applied to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_key_field")]
    pub key_field: String,
    /// Records seeded before any stream opens
    #[serde(default = "default_seed_records")]
    pub seed_records: i64,
    /// Pause between two table changes
    #[serde(default = "default_churn_interval_ms")]
    pub churn_interval_ms: u64,
    /// Drop and restore the connection every N changes (0 disables)
    #[serde(default = "default_bounce_every")]
    pub bounce_every: u64,
}

fn default_table() -> String {
    "nodes".to_string()
}

fn default_key_field() -> String {
    "id".to_string()
}

fn default_seed_records() -> i64 {
    100
}

fn default_churn_interval_ms() -> u64 {
    500
}

fn default_bounce_every() -> u64 {
    20
}

fn default_streams() -> Vec<StreamQuery> {
    vec![StreamQuery::table(default_table(), default_key_field())
        .with_start_item_number(0)
        .with_count(20)
        .with_stream_tag("nodes_view")]
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            key_field: default_key_field(),
            seed_records: default_seed_records(),
            churn_interval_ms: default_churn_interval_ms(),
            bounce_every: default_bounce_every(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            streams: default_streams(),
            demo: DemoConfig::default(),
        }
    }
}

impl WatchConfig {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use the built-in demo setup
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        for query in &self.streams {
            query
                .validate()
                .with_context(|| format!("stream '{}'", query.stream_tag))?;
        }
        if self.demo.churn_interval_ms == 0 {
            anyhow::bail!("demo.churn_interval_ms must be positive");
        }
        Ok(())
    }

    /// Apply command-line overrides
    pub fn merge_with_args(mut self, ack_timeout_ms: Option<u64>) -> Result<Self> {
        if let Some(ms) = ack_timeout_ms {
            self.client.ack_timeout_ms = ms;
        }
        self.client.validate()?;
        Ok(self)
    }
}
