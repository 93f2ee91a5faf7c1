//! Ordered window cache
//!
//! Holds the records of one subscription ordered by key, strictly increasing
//! with no duplicates, and keeps the window bounds wide enough to contain
//! every materialized record.
//!
//! Events are applied one at a time with a linear scan. Windows are bounded
//! by the subscription's `count`, so an `O(window)` insert keeps the order
//! incrementally without ever re-sorting.

mod key;

pub use key::RecordKey;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::config::EvictionPolicy;
use crate::protocol::StreamEvent;

/// A record as received from the server
pub type Record = Map<String, Value>;

/// Inclusive key range `[start_key, end_key]` of the materialized window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_key: Option<RecordKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_key: Option<RecordKey>,
}

impl WindowBounds {
    pub fn new(start_key: impl Into<RecordKey>, end_key: impl Into<RecordKey>) -> Self {
        Self {
            start_key: Some(start_key.into()),
            end_key: Some(end_key.into()),
        }
    }

    /// Whether `key` lies inside the window (unset bounds are open)
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.start_key.as_ref().map_or(true, |start| start <= key)
            && self.end_key.as_ref().map_or(true, |end| key <= end)
    }

    /// Lower `start_key` / raise `end_key` just enough to contain `key`
    ///
    /// Returns which bounds moved.
    pub(crate) fn cover(&mut self, key: &RecordKey) -> (bool, bool) {
        let lowered = match &self.start_key {
            Some(start) if start <= key => false,
            _ => {
                self.start_key = Some(key.clone());
                true
            }
        };
        let raised = match &self.end_key {
            Some(end) if key <= end => false,
            _ => {
                self.end_key = Some(key.clone());
                true
            }
        };
        (lowered, raised)
    }
}

/// What an applied event did to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Removed,
}

/// Description of one committed cache mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheChange {
    pub kind: ChangeKind,
    pub key: RecordKey,
    /// Position of the record after the mutation (before it, for removals)
    pub index: usize,
    /// Keys dropped by the eviction policy to make room
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evicted: Vec<RecordKey>,
}

#[derive(Debug, Clone)]
struct Entry {
    key: RecordKey,
    record: Record,
}

/// Ordered, keyed window of records
#[derive(Debug, Clone)]
pub struct WindowCache {
    key_field: String,
    entries: Vec<Entry>,
    eviction: EvictionPolicy,
    /// Maximum number of entries, derived from the policy and `count`
    limit: Option<usize>,
}

impl WindowCache {
    pub fn new(key_field: impl Into<String>, eviction: EvictionPolicy) -> Self {
        Self {
            key_field: key_field.into(),
            entries: Vec::new(),
            eviction,
            limit: None,
        }
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current eviction limit, if any
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Recompute the eviction limit from the subscription's `count`
    pub fn set_count(&mut self, count: Option<u64>) {
        self.limit = self.eviction.limit(count);
    }

    /// Borrow the records in key order
    ///
    /// Entries may be spliced by the next event; use [`snapshot`](Self::snapshot)
    /// to keep a copy.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.entries.iter().map(|e| &e.record)
    }

    /// Copy of the records in key order
    pub fn snapshot(&self) -> Vec<Record> {
        self.records().cloned().collect()
    }

    /// Keys in order
    pub fn keys(&self) -> Vec<RecordKey> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    pub fn get(&self, key: &RecordKey) -> Option<&Record> {
        self.locate(key).map(|i| &self.entries[i].record)
    }

    /// Index of the entry with `key` (linear scan, first match)
    pub fn locate(&self, key: &RecordKey) -> Option<usize> {
        self.entries.iter().position(|e| &e.key == key)
    }

    /// Apply one stream event, adjusting `bounds` as the window grows
    ///
    /// Returns `None` when nothing changed (delete of an absent key).
    pub fn apply(&mut self, event: StreamEvent, bounds: &mut WindowBounds) -> Option<CacheChange> {
        match event {
            StreamEvent::Delete { key } => self.remove(key),
            StreamEvent::Upsert { key, record } => Some(self.upsert(key, record, bounds)),
        }
    }

    fn remove(&mut self, key: RecordKey) -> Option<CacheChange> {
        match self.locate(&key) {
            Some(index) => {
                self.entries.remove(index);
                trace!(%key, index, "Removed record");
                Some(CacheChange {
                    kind: ChangeKind::Removed,
                    key,
                    index,
                    evicted: Vec::new(),
                })
            }
            None => {
                debug!(%key, "Delete for absent key ignored");
                None
            }
        }
    }

    fn upsert(&mut self, key: RecordKey, record: Record, bounds: &mut WindowBounds) -> CacheChange {
        if let Some(index) = self.locate(&key) {
            // keys never change once assigned, so the position is stable
            self.entries[index].record = record;
            trace!(%key, index, "Updated record in place");
            return CacheChange {
                kind: ChangeKind::Updated,
                key,
                index,
                evicted: Vec::new(),
            };
        }

        let index = match self.entries.iter().position(|e| e.key > key) {
            Some(index) => {
                self.entries.insert(
                    index,
                    Entry {
                        key: key.clone(),
                        record,
                    },
                );
                index
            }
            None => {
                self.entries.push(Entry {
                    key: key.clone(),
                    record,
                });
                self.entries.len() - 1
            }
        };

        let (lowered, raised) = bounds.cover(&key);
        if lowered || raised {
            debug!(%key, lowered, raised, "Window grew");
        }

        let (index, evicted) = self.evict(index, bounds);
        CacheChange {
            kind: ChangeKind::Inserted,
            key,
            index,
            evicted,
        }
    }

    /// Trim the cache back to its limit after inserting at `inserted`
    ///
    /// Growth at the front drops the greatest keys; any other insert drops
    /// the smallest. Bounds follow the new first/last key.
    fn evict(&mut self, inserted: usize, bounds: &mut WindowBounds) -> (usize, Vec<RecordKey>) {
        let Some(limit) = self.limit else {
            return (inserted, Vec::new());
        };
        if self.entries.len() <= limit {
            return (inserted, Vec::new());
        }

        // never drop the record that was just inserted
        let front = if inserted == 0 {
            0
        } else {
            (self.entries.len() - limit).min(inserted)
        };
        let mut dropped: Vec<RecordKey> = self.entries.drain(..front).map(|e| e.key).collect();
        if front > 0 {
            bounds.start_key = self.entries.first().map(|e| e.key.clone());
        }
        if self.entries.len() > limit {
            dropped.extend(self.entries.drain(limit..).map(|e| e.key));
            bounds.end_key = self.entries.last().map(|e| e.key.clone());
        }
        debug!(count = dropped.len(), limit, front, "Evicted records beyond window limit");
        (inserted - front, dropped)
    }

    /// Drop the greatest keys until the cache fits its limit again
    ///
    /// Needed when an ack lowers `count`; inserts trim on their own.
    pub fn trim(&mut self, bounds: &mut WindowBounds) -> Vec<RecordKey> {
        let Some(limit) = self.limit else {
            return Vec::new();
        };
        if self.entries.len() <= limit {
            return Vec::new();
        }
        let dropped: Vec<RecordKey> = self.entries.drain(limit..).map(|e| e.key).collect();
        bounds.end_key = self.entries.last().map(|e| e.key.clone());
        debug!(count = dropped.len(), limit, "Trimmed cache to lowered limit");
        dropped
    }

    /// Remove the given keys, returning the changes that were committed
    pub fn remove_keys(&mut self, keys: impl IntoIterator<Item = RecordKey>) -> Vec<CacheChange> {
        keys.into_iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Widen `bounds` so they contain every cached record
    ///
    /// Events may be applied before the ack that rewrote the bounds.
    pub fn widen_to_contents(&self, bounds: &mut WindowBounds) {
        if let (Some(first), Some(last)) = (self.entries.first(), self.entries.last()) {
            bounds.cover(&first.key);
            bounds.cover(&last.key);
        }
    }

    /// Switch to a different key field, re-ordering what is cached
    ///
    /// Records without a usable value for the new field are dropped.
    pub fn rekey(&mut self, key_field: impl Into<String>) {
        let key_field = key_field.into();
        if key_field == self.key_field {
            return;
        }
        let before = self.entries.len();
        let mut entries: Vec<Entry> = self
            .entries
            .drain(..)
            .filter_map(|e| {
                let key = e.record.get(&key_field).and_then(RecordKey::from_value)?;
                Some(Entry {
                    key,
                    record: e.record,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.dedup_by(|a, b| a.key == b.key);
        debug!(
            from = %self.key_field,
            to = %key_field,
            dropped = before - entries.len(),
            "Re-keyed cache"
        );
        self.entries = entries;
        self.key_field = key_field;
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
