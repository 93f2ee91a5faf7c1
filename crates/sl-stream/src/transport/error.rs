//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    /// Nothing on the other end handles this request
    #[error("No reply to '{0}'")]
    NoReply(String),
}
