//! Listener registry for gameplay code

use crate::core::PeerId;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

/// What a peer currently looks like to this node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerView {
    /// Latest snapshot of each object, keyed by object id
    pub objects: BTreeMap<String, Value>,
    /// Whether any of the peer's objects is active
    pub active: bool,
}

/// World view keyed by peer id
pub type PeerStates = BTreeMap<PeerId, PeerView>;

/// Coarse connection status shown to the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Discovering, or negotiating with a host
    Connecting,
    /// Hosting, or joined with an open channel
    Connected,
    /// Lost the host or stepped down
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(text)
    }
}

/// Events emitted to registered listeners
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// The remote object cache changed
    StateUpdate(PeerStates),
    /// Connection status changed
    Status {
        /// New status
        status: ConnectionStatus,
        /// Human-readable detail
        message: String,
    },
    /// Human-readable log line
    Log(String),
    /// The set of peers with an open channel changed
    PeersChanged(Vec<PeerId>),
}

/// Selector used when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkEventKind {
    /// [`NetworkEvent::StateUpdate`]
    StateUpdate,
    /// [`NetworkEvent::Status`]
    Status,
    /// [`NetworkEvent::Log`]
    Log,
    /// [`NetworkEvent::PeersChanged`]
    PeersChanged,
}

impl NetworkEvent {
    /// Selector matching this event
    pub fn kind(&self) -> NetworkEventKind {
        match self {
            NetworkEvent::StateUpdate(_) => NetworkEventKind::StateUpdate,
            NetworkEvent::Status { .. } => NetworkEventKind::Status,
            NetworkEvent::Log(_) => NetworkEventKind::Log,
            NetworkEvent::PeersChanged(_) => NetworkEventKind::PeersChanged,
        }
    }
}

/// Handle returned by [`EventBus::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&NetworkEvent) + Send + Sync>;

/// Listeners keyed by event kind, called in registration order
#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<NetworkEventKind, Vec<(ListenerId, Listener)>>,
    next_id: u64,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for events of `kind`
    pub fn on<F>(&mut self, kind: NetworkEventKind, callback: F) -> ListenerId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners
            .entry(kind)
            .or_default()
            .push((id, Box::new(callback)));
        id
    }

    /// Remove one listener; returns whether it existed
    pub fn off(&mut self, id: ListenerId) -> bool {
        let mut removed = false;
        for listeners in self.listeners.values_mut() {
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            removed |= listeners.len() != before;
        }
        removed
    }

    /// Deliver `event` to every listener registered for its kind.
    ///
    /// A panicking listener is logged and skipped; the rest still run.
    pub fn emit(&self, event: &NetworkEvent) {
        if let Some(listeners) = self.listeners.get(&event.kind()) {
            for (id, listener) in listeners {
                let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
                if delivered.is_err() {
                    warn!("Listener {:?} panicked on {:?} event", id, event.kind());
                }
            }
        }
    }

    /// Whether anyone listens for `kind`
    pub fn has_listeners(&self, kind: NetworkEventKind) -> bool {
        self.listeners.get(&kind).is_some_and(|l| !l.is_empty())
    }

    /// Drop every listener
    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}
