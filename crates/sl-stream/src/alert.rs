//! Advisory connectivity alerts for the UI boundary
//!
//! Alerts are informational only; they are not part of the cache contract.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Syslog-style severity of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "EMERGENCY",
            Self::Alert => "ALERT",
            Self::Critical => "CRITICAL",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Notice => "NOTICE",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message for the UI boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub message: String,
    pub level: AlertLevel,
}

impl Alert {
    pub fn new(level: AlertLevel, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
        }
    }

    /// Mirror the alert into the log at a matching level
    pub(crate) fn log(&self) {
        match self.level {
            AlertLevel::Emergency | AlertLevel::Alert | AlertLevel::Critical | AlertLevel::Error => {
                tracing::error!(level = %self.level, "{}", self.message)
            }
            AlertLevel::Warning => tracing::warn!(level = %self.level, "{}", self.message),
            AlertLevel::Notice | AlertLevel::Info => {
                tracing::info!(level = %self.level, "{}", self.message)
            }
            AlertLevel::Debug => tracing::debug!(level = %self.level, "{}", self.message),
        }
    }
}
