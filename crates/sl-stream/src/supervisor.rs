//! Connection supervisor
//!
//! Explicit context object owning the transport, the session registry and
//! the connectivity state. Inbound transport events are consumed by one
//! dispatch task in arrival order, so each stream event is fully applied
//! before the next one is looked at.
//!
//! On reconnect every registered session re-requests its *current* window:
//! the subscription resumes where it was rather than resetting to the query
//! it was created with. A lagged event feed is handled the same way, since
//! the dropped events may have been deletes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::{Alert, AlertLevel};
use crate::config::ClientConfig;
use crate::error::{StreamError, StreamResult};
use crate::protocol::StreamQuery;
use crate::session::{ChangeListener, StreamSession};
use crate::transport::{Transport, TransportEvent};

/// Live sessions keyed by stream tag
pub(crate) type SessionRegistry = RwLock<HashMap<String, Arc<StreamSession>>>;

/// Last known state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Never seen connected
    Initial,
    Connected,
    Disconnected,
}

/// Tracks connectivity and restores subscriptions after reconnect
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    sessions: Arc<SessionRegistry>,
    link: Mutex<LinkState>,
    alerts: broadcast::Sender<Alert>,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Arc<Self> {
        let (alerts, _) = broadcast::channel(config.alert_capacity.max(1));
        Arc::new(Self {
            transport,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            link: Mutex::new(LinkState::Initial),
            alerts,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// Receive advisory connectivity alerts
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn session(&self, stream_tag: &str) -> Option<Arc<StreamSession>> {
        self.sessions.read().get(stream_tag).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<StreamSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Register a session without starting it
    ///
    /// An empty `stream_tag` is replaced by a generated one.
    pub fn register(
        &self,
        mut query: StreamQuery,
        listener: impl ChangeListener + 'static,
    ) -> StreamResult<Arc<StreamSession>> {
        query.validate()?;
        if query.stream_tag.is_empty() {
            query.stream_tag = format!("{}-{}", query.source.name(), Uuid::new_v4());
        }

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&query.stream_tag) {
            return Err(StreamError::DuplicateStreamTag(query.stream_tag));
        }

        let session = Arc::new(StreamSession::new(
            query,
            self.transport.clone(),
            Arc::downgrade(&self.sessions),
            Arc::new(listener),
            self.config.ack_timeout(),
            self.config.eviction,
        ));
        sessions.insert(session.stream_tag().to_string(), session.clone());
        debug!(stream_tag = %session.stream_tag(), "Stream session registered");
        Ok(session)
    }

    /// Register a session and request its first window
    ///
    /// Only registration errors are returned. A failed first `start()` is
    /// logged and visible through [`StreamSession::status`]; the session stays
    /// registered so it can be retried or resumed on reconnect.
    pub async fn open_session(
        &self,
        query: StreamQuery,
        listener: impl ChangeListener + 'static,
    ) -> StreamResult<Arc<StreamSession>> {
        let session = self.register(query, listener)?;
        if let Err(e) = session.start().await {
            warn!(stream_tag = %session.stream_tag(), error = %e, "Initial subscription failed");
        }
        Ok(session)
    }

    /// Handle one transport event
    ///
    /// Stream data is applied synchronously; resubscription runs on spawned
    /// tasks so acks never block the event feed. Must be called from within
    /// a Tokio runtime.
    pub fn dispatch(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::Message { name, payload } => {
                let session = self.sessions.read().get(&name).cloned();
                match session {
                    Some(session) => {
                        session.apply_event(payload);
                    }
                    None => debug!(event = %name, "No session for inbound event"),
                }
            }
        }
    }

    fn on_connected(&self) {
        let previous = std::mem::replace(&mut *self.link.lock(), LinkState::Connected);
        match previous {
            LinkState::Initial => info!("Transport connected"),
            LinkState::Connected => debug!("Duplicate connect notification"),
            LinkState::Disconnected => {
                let resumed = self.resume_sessions();
                info!(sessions = resumed, "Transport reconnected, resuming streams");
                self.alert(Alert::new(
                    AlertLevel::Info,
                    format!("Connection restored, resuming {} stream(s)", resumed),
                ));
            }
        }
    }

    /// Resynchronize every registered session on its own task
    ///
    /// Returns how many were started.
    fn resume_sessions(&self) -> usize {
        let sessions = self.sessions();
        let count = sessions.len();
        for session in sessions {
            tokio::spawn(async move {
                if let Err(e) = session.resync().await {
                    warn!(stream_tag = %session.stream_tag(), error = %e, "Resubscribe failed");
                }
            });
        }
        count
    }

    fn on_disconnected(&self) {
        let previous = std::mem::replace(&mut *self.link.lock(), LinkState::Disconnected);
        if previous == LinkState::Disconnected {
            return;
        }
        warn!("Transport disconnected");
        self.alert(Alert::new(AlertLevel::Warning, "Connection to server lost"));
    }

    fn alert(&self, alert: Alert) {
        alert.log();
        // no receivers is fine
        let _ = self.alerts.send(alert);
    }

    /// Consume transport events until the channel closes
    pub async fn run(self: Arc<Self>) {
        let events = self.transport.subscribe();
        self.run_with(events).await
    }

    async fn run_with(self: Arc<Self>, mut events: broadcast::Receiver<TransportEvent>) {
        if self.link_state() == LinkState::Initial && self.transport.is_connected().await {
            *self.link.lock() = LinkState::Connected;
        }

        loop {
            match events.recv().await {
                Ok(event) => self.dispatch(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    let resumed = self.resume_sessions();
                    warn!(skipped = n, sessions = resumed, "Transport event feed lagged, resynchronizing");
                    self.alert(Alert::new(
                        AlertLevel::Error,
                        format!(
                            "Dropped {} stream event(s), resynchronizing {} stream(s)",
                            n, resumed
                        ),
                    ));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Transport event feed closed");
                    break;
                }
            }
        }
    }

    /// Start the dispatch loop on a background task
    ///
    /// The event subscription is taken before returning, so nothing sent
    /// after this call is missed.
    pub fn spawn(self: &Arc<Self>) -> SupervisorHandle {
        let events = self.transport.subscribe();
        let this = self.clone();
        SupervisorHandle {
            handle: tokio::spawn(this.run_with(events)),
        }
    }

    /// Close every registered session
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<StreamSession>> =
            self.sessions.write().drain().map(|(_, s)| s).collect();
        info!(sessions = sessions.len(), "Shutting down stream sessions");
        for session in sessions {
            if let Err(e) = session.close().await {
                debug!(stream_tag = %session.stream_tag(), error = %e, "Leave not delivered");
            }
        }
    }
}

/// Handle to a running dispatch loop
pub struct SupervisorHandle {
    handle: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Stop the dispatch loop
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
