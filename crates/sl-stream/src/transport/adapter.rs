//! Transport trait and inbound event types

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::TransportError;

/// Something the channel delivered
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Channel (re)established
    Connected,
    /// Channel lost; the transport reconnects on its own
    Disconnected,
    /// Named event from the server; stream data is named by its stream tag
    Message { name: String, payload: Value },
}

/// Bidirectional named-event channel
///
/// Implementations must deliver [`TransportEvent`]s in the order they arrived
/// on the wire; session ordering guarantees depend on it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an event without waiting for a reply
    async fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Send an event and wait for its acknowledgement payload
    ///
    /// Callers bound the wait themselves.
    async fn request(&self, event: &str, payload: Value) -> Result<Value, TransportError>;

    /// Subscribe to inbound events and connectivity changes
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Check if the channel is currently up
    async fn is_connected(&self) -> bool;
}
