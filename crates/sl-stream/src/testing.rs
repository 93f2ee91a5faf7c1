//! Test utilities for sl-stream
//!
//! [`SimulatedTable`] plays the server side of the protocol on top of a
//! [`MockTransport`]: it answers `startstream` with the range it would
//! materialize, streams the records of that range, and pushes later changes
//! to every subscription whose window they touch.
//!
//! ```rust,ignore
//! let transport = Arc::new(MockTransport::default());
//! let table = SimulatedTable::attach("nodes", "id", transport.clone());
//! table.seed((1..=100).map(|id| json!({ "id": id })));
//!
//! let supervisor = ConnectionSupervisor::new(transport, ClientConfig::default());
//! let _loop = supervisor.spawn();
//! let session = supervisor
//!     .open_session(StreamQuery::table("nodes", "id").with_count(10), |_: &StreamUpdate| {})
//!     .await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::cache::{Record, RecordKey, WindowBounds};
use crate::error::StreamResult;
use crate::protocol::{StreamAck, StreamEvent, LEAVE_STREAM, START_STREAM};
use crate::transport::MockTransport;

/// One `restrict_by` entry
#[derive(Debug, Clone, Deserialize)]
pub struct Restriction {
    pub field_name: String,
    pub op: RestrictionOp,
    pub value: Value,
}

/// Comparison used by a restriction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RestrictionOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl Restriction {
    /// Whether `record` passes this restriction
    pub fn matches(&self, record: &Record) -> bool {
        let Some(field) = record.get(&self.field_name) else {
            return false;
        };
        let ordered = RecordKey::from_value(field).zip(RecordKey::from_value(&self.value));
        match (self.op, ordered) {
            (RestrictionOp::Eq, Some((a, b))) => a == b,
            (RestrictionOp::Ne, Some((a, b))) => a != b,
            (RestrictionOp::Eq, None) => field == &self.value,
            (RestrictionOp::Ne, None) => field != &self.value,
            (RestrictionOp::Lt, Some((a, b))) => a < b,
            (RestrictionOp::Le, Some((a, b))) => a <= b,
            (RestrictionOp::Gt, Some((a, b))) => a > b,
            (RestrictionOp::Ge, Some((a, b))) => a >= b,
            (_, None) => false,
        }
    }
}

/// Range materialized for one request
#[derive(Debug, Clone, PartialEq)]
pub struct RangeResult {
    pub ack: StreamAck,
    pub records: Vec<Record>,
}

/// Parameters of a range query
#[derive(Debug, Clone, Default)]
pub struct RangeQuery {
    pub window: WindowBounds,
    pub start_item_number: Option<i64>,
    pub count: Option<u64>,
    pub restrict_by: Vec<Restriction>,
}

#[derive(Debug, Clone)]
struct ServerSubscription {
    window: WindowBounds,
    restrict_by: Vec<Restriction>,
    at_start: bool,
    at_end: bool,
}

impl ServerSubscription {
    fn admits(&self, record: &Record) -> bool {
        self.restrict_by.iter().all(|r| r.matches(record))
    }

    /// Whether a new key belongs to this window, letting edge windows grow
    fn reaches(&self, key: &RecordKey) -> bool {
        if self.window.contains(key) {
            return true;
        }
        let below = self.window.start_key.as_ref().is_some_and(|s| key < s);
        let above = self.window.end_key.as_ref().is_some_and(|e| key > e);
        (below && self.at_start) || (above && self.at_end)
    }
}

#[derive(Default)]
struct TableState {
    records: BTreeMap<RecordKey, Record>,
    subscriptions: HashMap<String, ServerSubscription>,
}

/// In-memory server table speaking the stream protocol over a mock transport
pub struct SimulatedTable {
    name: String,
    key_field: String,
    transport: Arc<MockTransport>,
    state: RwLock<TableState>,
}

impl SimulatedTable {
    /// Create the table and install it as the transport's responder
    pub fn attach(
        name: impl Into<String>,
        key_field: impl Into<String>,
        transport: Arc<MockTransport>,
    ) -> Arc<Self> {
        let table = Arc::new(Self {
            name: name.into(),
            key_field: key_field.into(),
            transport: transport.clone(),
            state: RwLock::new(TableState::default()),
        });

        let weak: Weak<Self> = Arc::downgrade(&table);
        transport.set_responder(move |event, payload| {
            let table = weak.upgrade()?;
            match event {
                START_STREAM => Some(table.handle_start(payload)),
                LEAVE_STREAM => {
                    table.handle_leave(payload);
                    None
                }
                other => Some(StreamAck::error_reply(format!("unknown request '{}'", other))),
            }
        });
        table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Stream tags the table is currently serving
    pub fn subscribers(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.state.read().subscriptions.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Insert records without notifying anyone
    pub fn seed(&self, records: impl IntoIterator<Item = Value>) {
        let mut state = self.state.write();
        for value in records {
            if let Ok(StreamEvent::Upsert { key, record }) = StreamEvent::parse(&value, &self.key_field)
            {
                state.records.insert(key, record);
            }
        }
    }

    /// Add or modify a record and push it to every subscription it reaches
    pub fn upsert(&self, value: Value) -> StreamResult<RecordKey> {
        let (key, record) = match StreamEvent::parse(&value, &self.key_field)? {
            StreamEvent::Upsert { key, record } => (key, record),
            StreamEvent::Delete { key } => {
                self.delete(&key);
                return Ok(key);
            }
        };

        let mut state = self.state.write();
        state.records.insert(key.clone(), record.clone());
        for (tag, sub) in state.subscriptions.iter_mut() {
            if sub.admits(&record) && sub.reaches(&key) {
                sub.window.cover(&key);
                self.transport.inject(tag.clone(), Value::Object(record.clone()));
            }
        }
        Ok(key)
    }

    /// Remove a record and push a delete marker to subscriptions holding it
    ///
    /// Returns whether the key existed.
    pub fn delete(&self, key: &RecordKey) -> bool {
        let mut state = self.state.write();
        let Some(record) = state.records.remove(key) else {
            return false;
        };
        for (tag, sub) in state.subscriptions.iter() {
            if sub.admits(&record) && sub.window.contains(key) {
                self.transport.inject(tag.clone(), StreamEvent::delete_marker(key));
            }
        }
        true
    }

    /// Compute the range a request would materialize
    ///
    /// Start is the first key `>= start_key`, or the item at
    /// `start_item_number` (negative counts from the end). End is the last
    /// key `<= end_key`, or `count` items from the start.
    pub fn range(&self, query: &RangeQuery) -> Result<RangeResult, String> {
        let state = self.state.read();
        let keys: Vec<&RecordKey> = state
            .records
            .iter()
            .filter(|(_, record)| query.restrict_by.iter().all(|r| r.matches(record)))
            .map(|(key, _)| key)
            .collect();
        if keys.is_empty() {
            return Err("no records in range".to_string());
        }
        let len = keys.len();

        let sidx = match &query.window.start_key {
            None => {
                let n = query.start_item_number.unwrap_or(0);
                if n < 0 {
                    len.saturating_sub(n.unsigned_abs() as usize)
                } else {
                    (n as usize).min(len - 1)
                }
            }
            Some(start) => keys
                .iter()
                .position(|k| *k >= start)
                .ok_or_else(|| format!("no key at or after {}", start))?,
        };

        let eidx = match &query.window.end_key {
            None => match query.count {
                Some(0) => return Err("count must be positive".to_string()),
                Some(count) => {
                    let count = usize::try_from(count).unwrap_or(usize::MAX);
                    sidx.saturating_add(count - 1).min(len - 1)
                }
                None => len - 1,
            },
            Some(end) => keys
                .iter()
                .rposition(|k| *k <= end)
                .filter(|&i| i >= sidx)
                .ok_or_else(|| format!("no key between start and {}", end))?,
        };

        let records = keys[sidx..=eidx]
            .iter()
            .filter_map(|k| state.records.get(*k).cloned())
            .collect();
        Ok(RangeResult {
            ack: StreamAck {
                start_key: keys[sidx].clone(),
                end_key: keys[eidx].clone(),
                count: (eidx - sidx + 1) as u64,
                start_item_number: sidx as i64,
                total_item_count: len as u64,
                record_type: None,
                key_field: None,
                at_start: Some(sidx == 0),
                at_end: Some(eidx == len - 1),
            },
            records,
        })
    }

    fn handle_start(&self, payload: &Value) -> Value {
        match self.start_stream(payload) {
            Ok(ack) => ack,
            Err(message) => {
                debug!(table = %self.name, %message, "Rejecting startstream");
                StreamAck::error_reply(message)
            }
        }
    }

    fn start_stream(&self, payload: &Value) -> Result<Value, String> {
        let field = |name: &str| {
            payload
                .get(name)
                .ok_or_else(|| format!("'{}' field missing in request", name))
        };

        let record_type = payload.get("record_type").and_then(Value::as_str);
        let source = payload
            .get("table_name")
            .and_then(Value::as_str)
            .or(record_type)
            .ok_or_else(|| "'table_name' field missing in request".to_string())?;
        if source != self.name {
            return Err(format!("unknown table '{}'", source));
        }

        let key_field = field("key_field")?.as_str().unwrap_or_default();
        if record_type.is_none() && key_field != self.key_field {
            return Err(format!(
                "key_field '{}' does not match table key '{}'",
                key_field, self.key_field
            ));
        }
        let stream_tag = field("stream_tag")?
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "stream_tag must be a non-empty string".to_string())?
            .to_string();

        let restrict_by: Vec<Restriction> = match payload.get("restrict_by") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| format!("invalid restrict_by: {}", e))?,
            None => Vec::new(),
        };
        let key = |name: &str| payload.get(name).and_then(RecordKey::from_value);
        let query = RangeQuery {
            window: WindowBounds {
                start_key: key("start_key"),
                end_key: key("end_key"),
            },
            start_item_number: payload.get("start_item_number").and_then(Value::as_i64),
            count: payload.get("count").and_then(Value::as_u64),
            restrict_by: restrict_by.clone(),
        };

        let RangeResult { mut ack, records } = self.range(&query)?;
        if record_type.is_some() {
            ack.record_type = Some(self.name.clone());
            ack.key_field = Some(self.key_field.clone());
        }

        self.state.write().subscriptions.insert(
            stream_tag.clone(),
            ServerSubscription {
                window: WindowBounds {
                    start_key: Some(ack.start_key.clone()),
                    end_key: Some(ack.end_key.clone()),
                },
                restrict_by,
                at_start: ack.at_start.unwrap_or(false),
                at_end: ack.at_end.unwrap_or(false),
            },
        );

        // the stream may overtake the ack
        for record in records {
            self.transport.inject(stream_tag.clone(), Value::Object(record));
        }
        debug!(table = %self.name, %stream_tag, count = ack.count, "Serving stream");

        serde_json::to_value(&ack).map_err(|e| e.to_string())
    }

    fn handle_leave(&self, payload: &Value) {
        if let Some(tag) = payload.get("stream_tag").and_then(Value::as_str) {
            if self.state.write().subscriptions.remove(tag).is_some() {
                debug!(table = %self.name, stream_tag = %tag, "Stream left");
            }
        }
    }
}

/// Build `count` numbered records `{ key_field: n, "name": "item-n" }`
pub fn numbered_records(key_field: &str, range: std::ops::RangeInclusive<i64>) -> Vec<Value> {
    range
        .map(|n| json!({ key_field: n, "name": format!("item-{}", n) }))
        .collect()
}
