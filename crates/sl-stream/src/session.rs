//! Stream session
//!
//! One subscription: its query, its cache, and the listener that hears about
//! every committed change. Sessions are created through
//! [`ConnectionSupervisor::open_session`](crate::ConnectionSupervisor::open_session)
//! and shared as `Arc<StreamSession>`; every callback works through that
//! handle rather than captured state.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{CacheChange, ChangeKind, Record, RecordKey, WindowCache};
use crate::config::EvictionPolicy;
use crate::error::{StreamError, StreamResult};
use crate::protocol::{StreamAck, StreamEvent, StreamQuery, LEAVE_STREAM, START_STREAM};
use crate::supervisor::SessionRegistry;
use crate::transport::Transport;

/// A committed change, as handed to the listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdate {
    pub stream_tag: String,
    pub change: CacheChange,
    /// The event payload exactly as received
    pub payload: Value,
}

/// Receives every applied change of a session
///
/// Called after the mutation is committed and the session lock released, so
/// the listener may call back into the session (e.g. `snapshot()`).
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, update: &StreamUpdate);
}

impl<F> ChangeListener for F
where
    F: Fn(&StreamUpdate) + Send + Sync,
{
    fn on_change(&self, update: &StreamUpdate) {
        self(update)
    }
}

impl ChangeListener for mpsc::UnboundedSender<StreamUpdate> {
    fn on_change(&self, update: &StreamUpdate) {
        if self.send(update.clone()).is_err() {
            debug!(stream_tag = %update.stream_tag, "Change receiver dropped");
        }
    }
}

/// Subscription lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for the first ack
    Pending,
    /// Last `start()` was acknowledged
    Active,
    /// Last `start()` failed; the session keeps its previous window
    Failed(String),
    Closed,
}

struct SessionState {
    query: StreamQuery,
    cache: WindowCache,
    status: SessionStatus,
    /// Keys cached when a resync went out and not re-sent since
    stale: Option<BTreeSet<RecordKey>>,
}

/// One windowed subscription and its cache
pub struct StreamSession {
    stream_tag: String,
    transport: Arc<dyn Transport>,
    registry: Weak<SessionRegistry>,
    listener: Arc<dyn ChangeListener>,
    ack_timeout: Duration,
    state: RwLock<SessionState>,
    closed: AtomicBool,
}

impl StreamSession {
    pub(crate) fn new(
        query: StreamQuery,
        transport: Arc<dyn Transport>,
        registry: Weak<SessionRegistry>,
        listener: Arc<dyn ChangeListener>,
        ack_timeout: Duration,
        eviction: EvictionPolicy,
    ) -> Self {
        let mut cache = WindowCache::new(query.key_field.clone(), eviction);
        cache.set_count(query.count);
        Self {
            stream_tag: query.stream_tag.clone(),
            transport,
            registry,
            listener,
            ack_timeout,
            state: RwLock::new(SessionState {
                query,
                cache,
                status: SessionStatus::Pending,
                stale: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn stream_tag(&self) -> &str {
        &self.stream_tag
    }

    /// Copy of the current query, including acknowledged window
    pub fn query(&self) -> StreamQuery {
        self.state.read().query.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().status.clone()
    }

    /// Copy of the cached records in key order
    pub fn snapshot(&self) -> Vec<Record> {
        self.state.read().cache.snapshot()
    }

    pub fn len(&self) -> usize {
        self.state.read().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().cache.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Request (or re-request) the subscription for the current window
    ///
    /// Sends `startstream` with the query as it stands now, which after
    /// earlier acks or window growth may differ from the construction-time
    /// query. On any failure the cache and query are left untouched.
    pub async fn start(&self) -> StreamResult<StreamAck> {
        self.subscribe(false).await
    }

    /// Re-request the current window after events may have been lost
    ///
    /// Works like [`start`](Self::start), and additionally removes every
    /// record that was cached when the request went out and has not been
    /// re-sent by the time the ack is handled. Records the server streams
    /// after its ack are inserted again when they arrive.
    pub async fn resync(&self) -> StreamResult<StreamAck> {
        self.subscribe(true).await
    }

    async fn subscribe(&self, resync: bool) -> StreamResult<StreamAck> {
        if self.is_closed() {
            return Err(StreamError::Closed(self.stream_tag.clone()));
        }

        let request = {
            let mut state = self.state.write();
            let request = state.query.to_request()?;
            if resync {
                let keys: BTreeSet<RecordKey> = state.cache.keys().into_iter().collect();
                state.stale = Some(keys);
            }
            request
        };
        debug!(stream_tag = %self.stream_tag, %request, resync, "Requesting stream");

        let result =
            match tokio::time::timeout(self.ack_timeout, self.transport.request(START_STREAM, request))
                .await
            {
                Ok(Ok(reply)) => StreamAck::parse(reply),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(StreamError::AckTimeout(self.ack_timeout)),
            };

        let ack = match result {
            Ok(ack) => ack,
            Err(e) => {
                warn!(stream_tag = %self.stream_tag, error = %e, "Stream subscription failed");
                let mut state = self.state.write();
                if resync {
                    state.stale = None;
                }
                if state.status != SessionStatus::Closed {
                    state.status = SessionStatus::Failed(e.to_string());
                }
                return Err(e);
            }
        };

        let removed = {
            let mut state = self.state.write();
            if state.status == SessionStatus::Closed {
                return Err(StreamError::Closed(self.stream_tag.clone()));
            }
            let SessionState {
                query,
                cache,
                status,
                stale,
            } = &mut *state;

            let key_change = query.apply_ack(&ack);
            let mut removed = match stale.take() {
                Some(keys) => cache.remove_keys(keys),
                None => Vec::new(),
            };
            if let Some(key_field) = key_change {
                cache.rekey(key_field);
            }
            cache.set_count(query.count);
            cache.widen_to_contents(&mut query.window);
            let trimmed = cache.trim(&mut query.window);
            let kept = cache.len();
            removed.extend(trimmed.into_iter().map(|key| CacheChange {
                kind: ChangeKind::Removed,
                key,
                index: kept,
                evicted: Vec::new(),
            }));
            *status = SessionStatus::Active;
            removed
        };

        info!(
            stream_tag = %self.stream_tag,
            start_key = %ack.start_key,
            end_key = %ack.end_key,
            count = ack.count,
            total = ack.total_item_count,
            removed = removed.len(),
            "Stream acknowledged"
        );
        for change in removed {
            self.notify(change.clone(), StreamEvent::delete_marker(&change.key));
        }
        Ok(ack)
    }

    /// Apply one inbound data event and notify the listener
    ///
    /// Malformed payloads are dropped; a delete for an absent key changes
    /// nothing and notifies no one. Returns the committed change, if any.
    pub fn apply_event(&self, payload: Value) -> Option<CacheChange> {
        if self.is_closed() {
            debug!(stream_tag = %self.stream_tag, "Event for closed session ignored");
            return None;
        }

        let change = {
            let mut state = self.state.write();
            let SessionState {
                query,
                cache,
                stale,
                ..
            } = &mut *state;
            let event = match StreamEvent::parse(&payload, &query.key_field) {
                Ok(event) => event,
                Err(e) => {
                    warn!(stream_tag = %self.stream_tag, error = %e, "Dropping malformed stream event");
                    return None;
                }
            };
            if let Some(stale) = stale {
                stale.remove(event.key());
            }
            cache.apply(event, &mut query.window)?
        };

        self.notify(change.clone(), payload);
        Some(change)
    }

    fn notify(&self, change: CacheChange, payload: Value) {
        self.listener.on_change(&StreamUpdate {
            stream_tag: self.stream_tag.clone(),
            change,
            payload,
        });
    }

    /// Tear the session down
    ///
    /// Deregisters from the supervisor, discards the cache and tells the
    /// server to drop the subscription. The session is closed even when the
    /// `leave` message cannot be sent. Calling it again does nothing.
    pub async fn close(&self) -> StreamResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.write().remove(&self.stream_tag);
        }
        {
            let mut state = self.state.write();
            state.cache.clear();
            state.status = SessionStatus::Closed;
        }
        info!(stream_tag = %self.stream_tag, "Stream session closed");

        self.transport
            .emit(LEAVE_STREAM, json!({ "stream_tag": self.stream_tag }))
            .await
            .map_err(StreamError::from)
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("stream_tag", &self.stream_tag)
            .field("status", &self.status())
            .field("len", &self.len())
            .finish()
    }
}
