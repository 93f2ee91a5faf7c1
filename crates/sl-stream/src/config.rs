//! Client configuration
//!
//! Settings shared by every session opened through one
//! [`ConnectionSupervisor`](crate::ConnectionSupervisor).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};

/// Configuration for the stream client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// How long `start()` waits for the subscription ack
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Cache growth policy for local inserts
    #[serde(default)]
    pub eviction: EvictionPolicy,
    /// Capacity of the advisory alert channel
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_alert_capacity() -> usize {
    64
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            eviction: EvictionPolicy::default(),
            alert_capacity: default_alert_capacity(),
        }
    }
}

impl ClientConfig {
    /// Parse from TOML text
    pub fn from_toml(text: &str) -> StreamResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| StreamError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.ack_timeout_ms == 0 {
            return Err(StreamError::Config("ack_timeout_ms must be positive".into()));
        }
        if self.alert_capacity == 0 {
            return Err(StreamError::Config("alert_capacity must be positive".into()));
        }
        if let EvictionPolicy::Bounded { factor: 0 } = self.eviction {
            return Err(StreamError::Config("eviction factor must be at least 1".into()));
        }
        Ok(())
    }
}

/// How far local inserts may grow a window past its acknowledged `count`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Never evict
    Unbounded,
    /// Keep at most `factor * count` records
    Bounded { factor: usize },
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::Bounded { factor: 2 }
    }
}

impl EvictionPolicy {
    /// Maximum cache length for a window of `count` records
    ///
    /// Unknown or zero `count` means no limit.
    pub fn limit(&self, count: Option<u64>) -> Option<usize> {
        match (self, count) {
            (Self::Bounded { factor }, Some(count)) if count > 0 && *factor > 0 => {
                Some((count as usize).saturating_mul(*factor))
            }
            _ => None,
        }
    }
}
