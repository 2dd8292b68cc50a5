//! Entity state on either side of the wire

use crate::core::{PeerId, Result, Timestamp};
use serde::Serialize;
use serde_json::{Map, Value};

/// Snapshot field carrying the producer's entity type
pub const TYPE_FIELD: &str = "type";
/// Snapshot field carrying the production time (epoch ms)
pub const LAST_UPDATE_FIELD: &str = "lastUpdate";
/// Field added to relayed snapshots by a host
pub const ACTIVE_FIELD: &str = "active";

/// Cached last-known state of an entity owned by another peer
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    /// Owning peer
    pub peer_id: PeerId,
    /// Object id within the owning peer
    pub object_id: String,
    /// Latest snapshot
    pub state: Value,
    /// When the latest snapshot was produced
    pub last_update_time: Timestamp,
}

impl RemoteObject {
    /// Create from a first snapshot received at `received_at`
    pub fn new(peer_id: PeerId, object_id: String, state: Value, received_at: Timestamp) -> Self {
        let last_update_time = snapshot_time(&state).unwrap_or(received_at);
        Self {
            peer_id,
            object_id,
            state,
            last_update_time,
        }
    }

    /// Active while the last update is younger than `window_ms`
    pub fn is_active(&self, now: Timestamp, window_ms: u64) -> bool {
        now.saturating_sub(self.last_update_time) < window_ms
    }

    /// Apply a later snapshot.
    ///
    /// Snapshots older than the current one are ignored; returns whether the
    /// state was replaced.
    pub fn update(&mut self, state: Value, received_at: Timestamp) -> bool {
        let produced = snapshot_time(&state).unwrap_or(received_at);
        if produced < self.last_update_time {
            return false;
        }
        self.state = state;
        self.last_update_time = produced;
        true
    }
}

fn snapshot_time(state: &Value) -> Option<Timestamp> {
    state.get(LAST_UPDATE_FIELD).and_then(Value::as_u64)
}

type Producer = Box<dyn Fn() -> serde_json::Result<Value> + Send + Sync>;

/// A locally simulated entity whose state is broadcast every tick
pub struct LocalSender {
    kind: String,
    producer: Producer,
}

impl LocalSender {
    /// Wrap a producer of serializable snapshots, tagged with entity `kind`
    pub fn new<T, F>(kind: impl Into<String>, producer: F) -> Self
    where
        T: Serialize,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            producer: Box::new(move || serde_json::to_value(producer())),
        }
    }

    /// Entity type
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Produce `{type, ...fields, lastUpdate}` stamped with `now`.
    ///
    /// A `type` supplied by the producer replaces the sender's kind.
    /// A producer yielding a non-object is wrapped as `{"value": ..}`.
    pub fn serialize(&self, now: Timestamp) -> Result<Value> {
        let mut fields = Map::new();
        fields.insert(TYPE_FIELD.into(), Value::String(self.kind.clone()));
        // producer fields override the default type
        match (self.producer)()? {
            Value::Object(map) => fields.extend(map),
            other => {
                fields.insert("value".into(), other);
            }
        }
        fields.insert(LAST_UPDATE_FIELD.into(), Value::from(now));
        Ok(Value::Object(fields))
    }
}

impl std::fmt::Debug for LocalSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSender").field("kind", &self.kind).finish_non_exhaustive()
    }
}
