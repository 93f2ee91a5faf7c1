//! Wire payloads exchanged with the server
//!
//! - `startstream` request built from a [`StreamQuery`]
//! - ack reply parsed into a [`StreamAck`]
//! - data events (named by the stream tag) parsed into a [`StreamEvent`]

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{Record, RecordKey, WindowBounds};
use crate::error::{StreamError, StreamResult};

/// Event name of the subscription request
pub const START_STREAM: &str = "startstream";
/// Event name used to drop a subscription server-side
pub const LEAVE_STREAM: &str = "leave";
/// Field carrying the key of a deleted record
pub const DELETE_KEY_FIELD: &str = "_del_key";

/// Server-side collection a query streams from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    /// Stream a table by name
    TableName(String),
    /// Stream a record type; the server may pick the key field
    RecordType(String),
}

impl StreamSource {
    pub fn name(&self) -> &str {
        match self {
            Self::TableName(name) | Self::RecordType(name) => name,
        }
    }

    pub fn is_record_type(&self) -> bool {
        matches!(self, Self::RecordType(_))
    }
}

/// Query configuration of one subscription
///
/// Supplied by the caller; the window and pagination fields are later
/// rewritten by server acks and by local window growth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamQuery {
    #[serde(flatten)]
    pub source: StreamSource,
    pub key_field: String,
    /// Filters passed through to the server unchanged
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restrict_by: Vec<Value>,
    #[serde(flatten)]
    pub window: WindowBounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_item_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_item_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_children: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    /// Routes inbound events to this subscription; generated when empty
    #[serde(default)]
    pub stream_tag: String,
    /// Window touches the first item of the table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_start: Option<bool>,
    /// Window touches the last item of the table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_end: Option<bool>,
}

impl StreamQuery {
    /// Query a table by name
    pub fn table(table_name: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self::with_source(StreamSource::TableName(table_name.into()), key_field.into())
    }

    /// Query a record type
    pub fn record_type(record_type: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self::with_source(StreamSource::RecordType(record_type.into()), key_field.into())
    }

    fn with_source(source: StreamSource, key_field: String) -> Self {
        Self {
            source,
            key_field,
            restrict_by: Vec::new(),
            window: WindowBounds::default(),
            start_item_number: None,
            count: None,
            total_item_count: None,
            return_children: None,
            force: None,
            stream_tag: String::new(),
            at_start: None,
            at_end: None,
        }
    }

    pub fn with_stream_tag(mut self, tag: impl Into<String>) -> Self {
        self.stream_tag = tag.into();
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_start_item_number(mut self, n: i64) -> Self {
        self.start_item_number = Some(n);
        self
    }

    pub fn with_start_key(mut self, key: impl Into<RecordKey>) -> Self {
        self.window.start_key = Some(key.into());
        self
    }

    pub fn with_end_key(mut self, key: impl Into<RecordKey>) -> Self {
        self.window.end_key = Some(key.into());
        self
    }

    pub fn with_restriction(mut self, restriction: Value) -> Self {
        self.restrict_by.push(restriction);
        self
    }

    pub fn with_return_children(mut self, return_children: bool) -> Self {
        self.return_children = Some(return_children);
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = Some(force);
        self
    }

    /// Check the query can be sent
    pub fn validate(&self) -> StreamResult<()> {
        if self.source.name().is_empty() {
            return Err(StreamError::Config("table_name/record_type is empty".into()));
        }
        if self.key_field.is_empty() {
            return Err(StreamError::Config("key_field is empty".into()));
        }
        if self.key_field == DELETE_KEY_FIELD {
            return Err(StreamError::Config(format!(
                "{} is reserved for delete markers",
                DELETE_KEY_FIELD
            )));
        }
        Ok(())
    }

    /// Build the `startstream` payload from the current state
    pub fn to_request(&self) -> StreamResult<Value> {
        Ok(serde_json::to_value(StartStreamRequest::from(self))?)
    }

    /// Overwrite the window and pagination fields from an ack
    ///
    /// Returns the new key field when the server changed it.
    pub fn apply_ack(&mut self, ack: &StreamAck) -> Option<String> {
        self.window = WindowBounds {
            start_key: Some(ack.start_key.clone()),
            end_key: Some(ack.end_key.clone()),
        };
        self.count = Some(ack.count);
        self.start_item_number = Some(ack.start_item_number);
        self.total_item_count = Some(ack.total_item_count);
        self.at_start = ack.at_start;
        self.at_end = ack.at_end;

        if !self.source.is_record_type() {
            return None;
        }
        if let Some(record_type) = &ack.record_type {
            self.source = StreamSource::RecordType(record_type.clone());
        }
        match &ack.key_field {
            Some(key_field) if *key_field != self.key_field => {
                self.key_field = key_field.clone();
                Some(key_field.clone())
            }
            _ => None,
        }
    }
}

/// Outbound `startstream` payload
#[derive(Debug, Serialize)]
struct StartStreamRequest<'a> {
    #[serde(flatten)]
    source: &'a StreamSource,
    key_field: &'a str,
    #[serde(skip_serializing_if = "<[Value]>::is_empty")]
    restrict_by: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    start_key: Option<&'a RecordKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_item_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_key: Option<&'a RecordKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_children: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    force: Option<bool>,
    stream_tag: &'a str,
}

impl<'a> From<&'a StreamQuery> for StartStreamRequest<'a> {
    fn from(query: &'a StreamQuery) -> Self {
        Self {
            source: &query.source,
            key_field: &query.key_field,
            restrict_by: &query.restrict_by,
            start_key: query.window.start_key.as_ref(),
            start_item_number: query.start_item_number,
            count: query.count,
            end_key: query.window.end_key.as_ref(),
            return_children: query.return_children,
            force: query.force,
            stream_tag: &query.stream_tag,
        }
    }
}

/// Successful subscription acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamAck {
    pub start_key: RecordKey,
    pub end_key: RecordKey,
    pub count: u64,
    pub start_item_number: i64,
    pub total_item_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_start: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_end: Option<bool>,
}

impl StreamAck {
    /// Parse an ack reply
    ///
    /// `{ error }` becomes [`StreamError::Subscription`]; a reply missing any
    /// required field becomes [`StreamError::Protocol`].
    pub fn parse(reply: Value) -> StreamResult<Self> {
        if let Some(error) = reply.get("error") {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(StreamError::Subscription(message));
        }
        serde_json::from_value(reply)
            .map_err(|e| StreamError::protocol(format!("malformed ack: {}", e)))
    }

    /// Reply payload carrying an error
    pub fn error_reply(message: impl Into<String>) -> Value {
        serde_json::json!({ "error": message.into() })
    }
}

/// Parsed inbound data event
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Add or modify a record
    Upsert { key: RecordKey, record: Record },
    /// Remove the record with this key
    Delete { key: RecordKey },
}

impl StreamEvent {
    /// Parse a data event for a stream keyed by `key_field`
    pub fn parse(payload: &Value, key_field: &str) -> StreamResult<Self> {
        let object = payload
            .as_object()
            .ok_or_else(|| StreamError::protocol("stream event is not an object"))?;

        if let Some(raw) = object.get(DELETE_KEY_FIELD) {
            let key = RecordKey::from_value(raw).ok_or_else(|| {
                StreamError::protocol(format!("invalid {} value: {}", DELETE_KEY_FIELD, raw))
            })?;
            return Ok(Self::Delete { key });
        }

        let raw = object.get(key_field).ok_or_else(|| {
            StreamError::protocol(format!("stream event missing key field '{}'", key_field))
        })?;
        let key = RecordKey::from_value(raw)
            .ok_or_else(|| StreamError::protocol(format!("invalid key value: {}", raw)))?;
        Ok(Self::Upsert {
            key,
            record: object.clone(),
        })
    }

    pub fn key(&self) -> &RecordKey {
        match self {
            Self::Upsert { key, .. } | Self::Delete { key } => key,
        }
    }

    /// Build a delete marker payload
    pub fn delete_marker(key: &RecordKey) -> Value {
        let mut object = Record::new();
        object.insert(DELETE_KEY_FIELD.to_string(), key.to_value());
        Value::Object(object)
    }
}
