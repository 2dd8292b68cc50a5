//! Directory service contract
//!
//! The directory is the only shared state between nodes before any peer
//! transport exists. It holds one ServerRecord per advertised host and, under
//! each host, a mailbox of transient signaling envelopes. Nothing stronger
//! than per-key insertion order and at-least-once notification is assumed.

mod memory;

pub use memory::MemoryDirectory;

use crate::core::{BoxFuture, DirectoryError, Notify, PeerId, Timestamp};
use crate::signaling::SignalingEnvelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Result type for directory operations
pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

/// Host advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Host peer id (also the record key)
    pub id: PeerId,
    /// Server-stamped time of the last create/heartbeat, epoch ms
    pub last_heartbeat: Timestamp,
    /// Whether the host accepts new clients
    pub joinable: bool,
}

impl ServerRecord {
    /// Age of the record at `now`
    pub fn age_ms(&self, now: Timestamp) -> u64 {
        now.saturating_sub(self.last_heartbeat)
    }

    /// A record is fresh while its age is below `max_age_ms`
    pub fn is_fresh(&self, now: Timestamp, max_age_ms: u64) -> bool {
        self.age_ms(now) < max_age_ms
    }
}

/// Document id of an envelope inside a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    /// Fresh random id
    pub fn random() -> Self {
        EnvelopeId(Uuid::new_v4())
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An envelope as stored in (and delivered from) a host mailbox
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEnvelope {
    /// Mailbox the envelope lives in
    pub host: PeerId,
    /// Document id, used for the consuming delete
    pub id: EnvelopeId,
    /// Envelope body, with the server timestamp filled in
    pub envelope: SignalingEnvelope,
}

/// Existence notifications for a watched ServerRecord
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    /// Record exists (created or refreshed)
    Present(ServerRecord),
    /// Record does not exist (deleted, or never existed)
    Deleted,
}

/// Handle returned by the subscribe calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Operations required from the shared record store.
///
/// Implementations stamp `last_heartbeat` and envelope timestamps with their
/// own clock ("server time"). Subscription sinks may be invoked from inside a
/// directory call, so they must only forward the value.
pub trait DirectoryService: Send + Sync {
    /// Most recently refreshed ServerRecord, if any
    fn latest_server(&self) -> BoxFuture<'_, DirectoryResult<Option<ServerRecord>>>;

    /// Create (or overwrite) a joinable ServerRecord stamped with server time
    fn create_server(&self, id: &PeerId) -> BoxFuture<'_, DirectoryResult<ServerRecord>>;

    /// Refresh `last_heartbeat` of an existing record
    fn touch_server(&self, id: &PeerId) -> BoxFuture<'_, DirectoryResult<ServerRecord>>;

    /// Delete a record and its mailbox; deleting a missing record is not an error
    fn delete_server(&self, id: &PeerId) -> BoxFuture<'_, DirectoryResult<()>>;

    /// Append an envelope to `host`'s mailbox, stamping the server timestamp
    fn post_envelope(
        &self,
        host: &PeerId,
        envelope: SignalingEnvelope,
    ) -> BoxFuture<'_, DirectoryResult<EnvelopeId>>;

    /// Delete one envelope; deleting a missing envelope is not an error
    fn delete_envelope(&self, host: &PeerId, id: EnvelopeId) -> BoxFuture<'_, DirectoryResult<()>>;

    /// Notify `sink` of every envelope in `host`'s mailbox addressed to
    /// `recipient`: existing ones first, then each later addition
    fn subscribe_mailbox(
        &self,
        host: &PeerId,
        recipient: &PeerId,
        sink: Notify<StoredEnvelope>,
    ) -> DirectoryResult<SubscriptionId>;

    /// Notify `sink` of the current existence of record `id`, then of each change
    fn watch_server(&self, id: &PeerId, sink: Notify<RecordChange>) -> DirectoryResult<SubscriptionId>;

    /// Drop a subscription; unknown ids are ignored
    fn unsubscribe(&self, subscription: SubscriptionId);
}
