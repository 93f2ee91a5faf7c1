//! Mock transport for testing

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::{Transport, TransportError, TransportEvent};

/// Server side of the mock
///
/// Sees every request and emit. For requests the returned value is the ack
/// and `None` means the server never answers; replies to emits are ignored.
/// Without a responder, requests fail with [`TransportError::NoReply`].
pub type Responder = Arc<dyn Fn(&str, &Value) -> Option<Value> + Send + Sync>;

/// Mock transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockTransportConfig {
    /// Simulated round-trip latency
    #[serde(default)]
    pub latency_ms: u64,
    /// Inbound event buffer
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    1024
}

impl Default for MockTransportConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            capacity: default_capacity(),
        }
    }
}

/// An outbound message recorded by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub event: String,
    pub payload: Value,
    /// Sent with `request` (true) or `emit` (false)
    pub expects_ack: bool,
}

/// In-memory transport
///
/// Records everything sent, answers requests through a pluggable responder,
/// and lets tests inject inbound events and flip connectivity.
pub struct MockTransport {
    config: MockTransportConfig,
    connected: AtomicBool,
    incoming_tx: broadcast::Sender<TransportEvent>,
    sent: Mutex<Vec<SentMessage>>,
    responder: RwLock<Option<Responder>>,
}

impl MockTransport {
    pub fn new(config: &MockTransportConfig) -> Self {
        let (incoming_tx, _) = broadcast::channel(config.capacity.max(1));
        Self {
            config: config.clone(),
            connected: AtomicBool::new(true),
            incoming_tx,
            sent: Mutex::new(Vec::new()),
            responder: RwLock::new(None),
        }
    }

    /// Install the function that answers requests
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        *self.responder.write() = Some(Arc::new(responder));
    }

    /// Answer every request by echoing the requested window back as an ack
    ///
    /// Missing bounds default to `0`.
    pub fn echo_acks(&self) {
        self.set_responder(|_, payload| {
            let field = |name: &str| payload.get(name).cloned().unwrap_or(Value::from(0));
            Some(serde_json::json!({
                "start_key": field("start_key"),
                "end_key": field("end_key"),
                "count": payload.get("count").cloned().unwrap_or(Value::from(0)),
                "start_item_number": payload.get("start_item_number").cloned().unwrap_or(Value::from(0)),
                "total_item_count": payload.get("count").cloned().unwrap_or(Value::from(0)),
            }))
        });
    }

    /// Inject an inbound named event
    pub fn inject(&self, name: impl Into<String>, payload: Value) {
        let _ = self.incoming_tx.send(TransportEvent::Message {
            name: name.into(),
            payload,
        });
    }

    /// Set connection state, announcing the transition to subscribers
    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was == connected {
            return;
        }
        let event = if connected {
            TransportEvent::Connected
        } else {
            TransportEvent::Disconnected
        };
        tracing::debug!(?event, "Mock transport: connectivity changed");
        let _ = self.incoming_tx.send(event);
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Payloads sent under a given event name
    pub fn sent_payloads(&self, event: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.event == event)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    fn record(&self, event: &str, payload: &Value, expects_ack: bool) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.sent.lock().push(SentMessage {
            event: event.to_string(),
            payload: payload.clone(),
            expects_ack,
        });
        Ok(())
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(&MockTransportConfig::default())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        self.record(event, &payload, false)?;
        self.simulate_latency().await;
        let responder = self.responder.read().clone();
        if let Some(respond) = responder {
            let _ = respond(event, &payload);
        }
        tracing::debug!(event, "Mock transport: emitted");
        Ok(())
    }

    async fn request(&self, event: &str, payload: Value) -> Result<Value, TransportError> {
        self.record(event, &payload, true)?;
        self.simulate_latency().await;

        let responder = self.responder.read().clone();
        let Some(respond) = responder else {
            return Err(TransportError::NoReply(event.to_string()));
        };
        match respond(event, &payload) {
            Some(reply) => Ok(reply),
            // a server that never acks; callers time out
            None => std::future::pending().await,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.incoming_tx.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
