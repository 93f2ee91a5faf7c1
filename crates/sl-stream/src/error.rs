//! Error types for stream sessions

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Result type for stream session operations
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Errors that can occur while subscribing to or applying a stream
///
/// None of these are fatal: a failed `start()` leaves the session's cache and
/// query untouched and may simply be retried.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Server rejected the subscription (ack carried an `error`)
    #[error("Subscription rejected: {0}")]
    Subscription(String),

    /// Ack or event did not have the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No ack arrived in time
    #[error("No acknowledgement within {0:?}")]
    AckTimeout(Duration),

    /// Underlying channel failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Another live session already uses this tag on the channel
    #[error("Stream tag already in use: {0}")]
    DuplicateStreamTag(String),

    /// Session was closed
    #[error("Session closed: {0}")]
    Closed(String),

    /// Invalid client or query configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StreamError {
    /// Create a protocol error from anything printable
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether calling `start()` again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Subscription(_) | Self::AckTimeout(_) | Self::Transport(_)
        )
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
