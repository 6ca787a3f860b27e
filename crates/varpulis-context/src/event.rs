//! Event types seen by context controllers and agent instances

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use varpulis_core::Value;

/// Type alias for IndexMap with FxBuildHasher for faster hashing of event fields.
pub type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// A shared reference to an Event. Partitions, controllers and agent
/// instances all hold the same event without cloning its payload.
pub type SharedEvent = Arc<Event>;

/// A runtime event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type name
    pub event_type: Arc<str>,
    /// Timestamp of the event (defaults to current server time if not provided)
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Event payload
    pub data: FxIndexMap<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<Arc<str>>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data: IndexMap::with_hasher(FxBuildHasher),
        }
    }

    /// Creates a new event from pre-built fields map.
    pub fn from_fields(event_type: impl Into<Arc<str>>, data: FxIndexMap<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    /// Set the timestamp from milliseconds since epoch. Out-of-range values
    /// leave the timestamp untouched.
    pub fn with_timestamp_ms(mut self, ms: i64) -> Self {
        if let Some(ts) = DateTime::<Utc>::from_timestamp_millis(ms) {
            self.timestamp = ts;
        }
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_int())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// The payload as a `Value::Map`, used when an event is exposed as a
    /// context property (e.g. the event that initiated a partition).
    pub fn to_value(&self) -> Value {
        Value::Map(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn into_shared(self) -> SharedEvent {
        Arc::new(self)
    }
}
