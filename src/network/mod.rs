//! Peer connections and state broadcast
//!
//! The [`NetworkManager`] owns one [`PeerConnection`] per remote peer, the
//! registry of [`LocalSender`]s and the cache of [`RemoteObject`]s. A host
//! fans one composite frame out to every open channel each tick; a client
//! sends only its own senders' snapshots up to the host.
//!
//! All methods expect to be called from a single dispatcher. Nothing here
//! locks.

mod events;
mod objects;
mod wire;

pub use events::{ConnectionStatus, EventBus, ListenerId, NetworkEvent, NetworkEventKind, PeerStates, PeerView};
pub use objects::{LocalSender, RemoteObject, ACTIVE_FIELD, LAST_UPDATE_FIELD, TYPE_FIELD};
pub use wire::{FrameStates, ObjectStates, WireMessage};

use crate::core::{Clock, NegotiationError, Notify, PeerId, Result, Role, SessionConfig, Timestamp};
use crate::signaling::{PeerSignal, SignalRelay};
use crate::system::metrics;
use crate::transport::{
    LinkEvent, LinkId, LinkSettings, LinkState, NegotiationRole, PeerLink, Transport, TransportEvent,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a [`PeerConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing sent
    New,
    /// Offer sent, waiting for the answer and connectivity
    Offering,
    /// Answer sent, waiting for connectivity
    Answering,
    /// Transport established
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Negotiation or transport failure
    Failed,
    /// Closed by either side
    Closed,
}

impl ConnectionState {
    /// Whether the connection is finished
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<LinkState> for ConnectionState {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::New => ConnectionState::New,
            LinkState::Connecting => ConnectionState::New,
            LinkState::Connected => ConnectionState::Connected,
            LinkState::Disconnected => ConnectionState::Disconnected,
            LinkState::Failed => ConnectionState::Failed,
            LinkState::Closed => ConnectionState::Closed,
        }
    }
}

/// One remote peer: its link and the data channel state
pub struct PeerConnection {
    link: Box<dyn PeerLink>,
    role: NegotiationRole,
    state: ConnectionState,
    channel_open: bool,
}

impl PeerConnection {
    fn new(link: Box<dyn PeerLink>, role: NegotiationRole, state: ConnectionState) -> Self {
        Self {
            link,
            role,
            state,
            channel_open: false,
        }
    }

    /// Negotiation state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Which side of the negotiation we are
    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    /// Link backing this connection
    pub fn link_id(&self) -> LinkId {
        self.link.id()
    }

    /// Whether the data channel has opened
    pub fn is_open(&self) -> bool {
        self.channel_open
    }
}

/// Connections, senders and remote state of one node
pub struct NetworkManager {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    link_settings: LinkSettings,
    link_sink: Notify<LinkEvent>,
    local_id: PeerId,
    role: Role,
    connections: HashMap<PeerId, PeerConnection>,
    next_link: u64,
    senders: BTreeMap<u64, LocalSender>,
    next_sender: u64,
    remote: BTreeMap<PeerId, BTreeMap<String, RemoteObject>>,
    last_activity: HashMap<(PeerId, String), bool>,
    bus: EventBus,
}

impl NetworkManager {
    /// Create a manager for `local_id`; transport events go to `link_sink`
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        local_id: PeerId,
        link_sink: Notify<LinkEvent>,
    ) -> Self {
        Self {
            link_settings: LinkSettings::from(&config),
            config,
            clock,
            transport,
            link_sink,
            local_id,
            role: Role::Undetermined,
            connections: HashMap::new(),
            next_link: 0,
            senders: BTreeMap::new(),
            next_sender: 0,
            remote: BTreeMap::new(),
            last_activity: HashMap::new(),
            bus: EventBus::new(),
        }
    }

    /// Adopt the id and role chosen by signaling
    pub fn set_identity(&mut self, local_id: PeerId, role: Role) {
        self.local_id = local_id;
        self.role = role;
    }

    /// This node's id
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Whether this node relays for others
    pub fn is_hosting(&self) -> bool {
        self.role.is_host()
    }

    /// Connection to `peer`, if any
    pub fn connection(&self, peer: &PeerId) -> Option<&PeerConnection> {
        self.connections.get(peer)
    }

    /// Whether `peer` has an open data channel
    pub fn has_open_channel(&self, peer: &PeerId) -> bool {
        self.connections.get(peer).is_some_and(PeerConnection::is_open)
    }

    /// Cached object `object_id` of `peer`
    pub fn remote_object(&self, peer: &PeerId, object_id: &str) -> Option<&RemoteObject> {
        self.remote.get(peer).and_then(|objects| objects.get(object_id))
    }

    // ---- gameplay surface ----

    /// Register a sender; returns its object id
    pub fn add_sender(&mut self, sender: LocalSender) -> u64 {
        let id = self.next_sender;
        self.next_sender += 1;
        debug!("registered {} sender {}", sender.kind(), id);
        self.senders.insert(id, sender);
        id
    }

    /// Unregister a sender; returns whether it existed
    pub fn remove_sender(&mut self, id: u64) -> bool {
        self.senders.remove(&id).is_some()
    }

    /// Number of registered senders
    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Subscribe to events of `kind`
    pub fn on<F>(&mut self, kind: NetworkEventKind, callback: F) -> ListenerId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, callback)
    }

    /// Unsubscribe a listener
    pub fn off(&mut self, id: ListenerId) -> bool {
        self.bus.off(id)
    }

    /// Peers with an open data channel, sorted
    pub fn get_connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.channel_open)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// World view: our own senders plus every cached peer
    pub fn get_states(&self) -> PeerStates {
        let now = self.clock.now_ms();
        let window = self.config.liveness_window_ms();
        let mut states = PeerStates::new();

        let own = self.local_snapshots(now);
        if !own.is_empty() {
            states.insert(
                self.local_id.clone(),
                PeerView {
                    objects: own,
                    active: true,
                },
            );
        }

        for (peer, objects) in &self.remote {
            states.insert(
                peer.clone(),
                PeerView {
                    objects: objects
                        .iter()
                        .map(|(id, obj)| (id.clone(), obj.state.clone()))
                        .collect(),
                    active: objects.values().any(|obj| obj.is_active(now, window)),
                },
            );
        }
        states
    }

    /// Publish a status change to listeners
    pub fn emit_status(&self, status: ConnectionStatus, message: impl Into<String>) {
        self.bus.emit(&NetworkEvent::Status {
            status,
            message: message.into(),
        });
    }

    /// Publish a log line to listeners
    pub fn emit_log(&self, line: impl Into<String>) {
        self.bus.emit(&NetworkEvent::Log(line.into()));
    }

    fn emit_state_update(&self) {
        if self.bus.has_listeners(NetworkEventKind::StateUpdate) {
            self.bus.emit(&NetworkEvent::StateUpdate(self.get_states()));
        }
    }

    fn emit_peers_changed(&self) {
        self.bus
            .emit(&NetworkEvent::PeersChanged(self.get_connected_peers()));
    }

    // ---- connection lifecycle ----

    fn allocate_link(&mut self) -> LinkId {
        self.next_link += 1;
        LinkId(self.next_link)
    }

    fn insert_connection(&mut self, peer: PeerId, conn: PeerConnection) {
        if let Some(mut previous) = self.connections.insert(peer.clone(), conn) {
            debug!("{} replaced by a new negotiation with {}", previous.link_id(), peer);
            if previous.channel_open {
                metrics::record(|m| m.network.connected_peers.dec());
            }
            previous.link.close();
        }
    }

    /// Open a connection to `peer` and send it our offer
    pub async fn initiate_connection(&mut self, peer: &PeerId, relay: &dyn SignalRelay) -> Result<()> {
        let link_id = self.allocate_link();
        let mut link = self.transport.open(
            &self.local_id,
            peer,
            link_id,
            NegotiationRole::Initiator,
            &self.link_settings,
            self.link_sink.clone(),
        )?;
        let offer = link.create_offer().await?;
        info!("offering {} to {}", link_id, peer);
        self.insert_connection(
            peer.clone(),
            PeerConnection::new(link, NegotiationRole::Initiator, ConnectionState::Offering),
        );
        relay.send_signal(peer, PeerSignal::Offer(offer)).await
    }

    /// Apply a signal received from `from`.
    ///
    /// Answers and candidates with no matching connection are dropped.
    pub async fn handle_peer_signal(
        &mut self,
        from: PeerId,
        signal: PeerSignal,
        relay: &dyn SignalRelay,
    ) -> Result<()> {
        match signal {
            PeerSignal::Offer(offer) => {
                let link_id = self.allocate_link();
                let mut link = self.transport.open(
                    &self.local_id,
                    &from,
                    link_id,
                    NegotiationRole::Responder,
                    &self.link_settings,
                    self.link_sink.clone(),
                )?;
                let answer = link.accept_offer(offer).await?;
                info!("answering {} on {}", from, link_id);
                self.insert_connection(
                    from.clone(),
                    PeerConnection::new(link, NegotiationRole::Responder, ConnectionState::Answering),
                );
                relay.send_signal(&from, PeerSignal::Answer(answer)).await
            }
            PeerSignal::Answer(answer) => {
                let Some(conn) = self.connections.get_mut(&from) else {
                    return drop_signal(NegotiationError::UnknownPeer(from.to_string()));
                };
                if conn.state != ConnectionState::Offering {
                    return drop_signal(NegotiationError::OutOfOrder {
                        signal: "answer",
                        state: conn.state.to_string(),
                    });
                }
                conn.link.apply_answer(answer).await?;
                Ok(())
            }
            PeerSignal::IceCandidate(candidate) => {
                let Some(conn) = self.connections.get_mut(&from) else {
                    return drop_signal(NegotiationError::UnknownPeer(from.to_string()));
                };
                conn.link.add_ice_candidate(candidate).await?;
                Ok(())
            }
        }
    }

    /// Apply a transport event.
    ///
    /// Returns the peer whose connection was torn down by this event, if any.
    pub async fn on_link_event(&mut self, event: LinkEvent, relay: &dyn SignalRelay) -> Option<PeerId> {
        let LinkEvent { link, remote, event } = event;
        let Some(conn) = self.connections.get_mut(&remote) else {
            trace!("event for unknown peer {}", remote);
            return None;
        };
        if conn.link_id() != link {
            trace!("ignoring event from superseded {} of {}", link, remote);
            return None;
        }

        match event {
            TransportEvent::StateChanged(state) => {
                debug!("connection with {} is {:?}", remote, state);
                if state.is_terminal() {
                    conn.state = state.into();
                    self.emit_log(format!("Connection {:?} for peer {}", state, remote));
                    if self.handle_disconnect(&remote) {
                        return Some(remote);
                    }
                } else if state == LinkState::Connected {
                    conn.state = ConnectionState::Connected;
                }
            }
            TransportEvent::IceCandidate(candidate) => {
                if let Err(e) = relay.send_signal(&remote, PeerSignal::IceCandidate(candidate)).await {
                    warn!("could not forward candidate to {}: {}", remote, e);
                }
            }
            TransportEvent::ChannelOpen => {
                conn.channel_open = true;
                metrics::record(|m| m.network.connected_peers.inc());
                info!("data channel open with {}", remote);
                self.emit_log(format!("Data channel opened with peer {}", remote));
                if let Some(host) = self.role.host() {
                    self.emit_status(ConnectionStatus::Connected, format!("Connected to {}", host));
                }
                self.emit_peers_changed();
            }
            TransportEvent::Message(text) => self.handle_message(&remote, &text),
            TransportEvent::ChannelClosed => {
                self.emit_log(format!("Data channel closed with peer {}", remote));
                if self.handle_disconnect(&remote) {
                    return Some(remote);
                }
            }
        }
        None
    }

    /// Tear down everything known about `peer`.
    ///
    /// Idempotent: returns false when there was nothing to tear down.
    pub fn handle_disconnect(&mut self, peer: &PeerId) -> bool {
        let Some(mut conn) = self.connections.remove(peer) else {
            return false;
        };
        conn.link.close();
        if conn.channel_open {
            metrics::record(|m| m.network.connected_peers.dec());
        }
        self.remote.remove(peer);
        self.last_activity.retain(|(owner, _), _| owner != peer);

        info!("peer {} disconnected ({})", peer, conn.state);
        metrics::record(|m| m.network.peer_disconnects.inc());

        if self.is_hosting() {
            self.broadcast_states();
        } else {
            self.emit_state_update();
        }
        self.emit_peers_changed();
        true
    }

    /// Close every connection and forget remote state; senders and listeners stay
    pub fn reset_connections(&mut self) {
        let open = self.connections.values().filter(|c| c.channel_open).count() as i64;
        for (_, mut conn) in self.connections.drain() {
            conn.link.close();
        }
        metrics::record(|m| m.network.connected_peers.sub(open));
        self.remote.clear();
        self.last_activity.clear();
        self.emit_state_update();
        self.emit_peers_changed();
    }

    /// Full teardown: connections, remote state, senders and listeners
    pub fn cleanup(&mut self) {
        self.reset_connections();
        self.senders.clear();
        self.next_sender = 0;
        self.bus.clear();
    }

    // ---- periodic work ----

    /// One broadcast (host) or uplink (client) step
    pub fn tick(&mut self) {
        if self.is_hosting() {
            self.broadcast_states();
        } else {
            self.send_state_to_host();
        }
    }

    fn local_snapshots(&self, now: Timestamp) -> BTreeMap<String, Value> {
        let mut snapshots = BTreeMap::new();
        for (id, sender) in &self.senders {
            match sender.serialize(now) {
                Ok(snapshot) => {
                    snapshots.insert(id.to_string(), snapshot);
                }
                Err(e) => warn!("sender {} ({}) failed to serialize: {}", id, sender.kind(), e),
            }
        }
        snapshots
    }

    fn compose_host_frame(&self, now: Timestamp) -> WireMessage {
        let window = self.config.liveness_window_ms();
        let mut states = FrameStates::new();

        let own = self.local_snapshots(now);
        if !own.is_empty() {
            states.insert(self.local_id.clone(), own);
        }
        for (peer, objects) in &self.remote {
            let relayed = objects
                .iter()
                .map(|(id, obj)| {
                    let mut state = obj.state.clone();
                    if let Value::Object(fields) = &mut state {
                        fields.insert(ACTIVE_FIELD.into(), Value::Bool(obj.is_active(now, window)));
                    }
                    (id.clone(), state)
                })
                .collect();
            states.insert(peer.clone(), relayed);
        }
        WireMessage::StateUpdate { states }
    }

    /// Send one composite frame to every open channel (host only).
    ///
    /// Returns the number of channels written.
    pub fn broadcast_states(&mut self) -> usize {
        if !self.is_hosting() {
            return 0;
        }
        let frame = self.compose_host_frame(self.clock.now_ms());
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("could not encode frame: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        for (peer, conn) in self.connections.iter().filter(|(_, c)| c.channel_open) {
            match conn.link.send(&text) {
                Ok(()) => sent += 1,
                Err(e) => warn!("broadcast to {} failed: {}", peer, e),
            }
        }
        metrics::record(|m| m.network.frames_sent.inc_by(sent as u64));
        self.emit_state_update();
        sent
    }

    /// Send our own senders' snapshots to the host (client only).
    ///
    /// Returns whether a frame was written.
    pub fn send_state_to_host(&mut self) -> bool {
        if self.senders.is_empty() {
            return false;
        }
        let Some(host) = self.role.host() else {
            return false;
        };
        let Some(conn) = self.connections.get(host).filter(|c| c.channel_open) else {
            return false;
        };

        let mut states = FrameStates::new();
        states.insert(self.local_id.clone(), self.local_snapshots(self.clock.now_ms()));
        let text = match (WireMessage::StateUpdate { states }).encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("could not encode uplink: {}", e);
                return false;
            }
        };
        match conn.link.send(&text) {
            Ok(()) => {
                metrics::record(|m| m.network.frames_sent.inc());
                true
            }
            Err(e) => {
                warn!("uplink to {} failed: {}", host, e);
                false
            }
        }
    }

    /// Recompute activity of every cached object (host only).
    ///
    /// Any active/inactive edge since the previous sweep triggers an
    /// immediate broadcast. Returns whether one happened.
    pub fn check_inactive_peers(&mut self) -> bool {
        if !self.is_hosting() {
            return false;
        }
        let now = self.clock.now_ms();
        let window = self.config.liveness_window_ms();
        let mut changed = false;
        for (peer, objects) in &self.remote {
            for (id, obj) in objects {
                let active = obj.is_active(now, window);
                let previous = self
                    .last_activity
                    .insert((peer.clone(), id.clone()), active)
                    .unwrap_or(true);
                if previous != active {
                    debug!("{}/{} became {}", peer, id, if active { "active" } else { "inactive" });
                    changed = true;
                }
            }
        }
        if changed {
            self.broadcast_states();
        }
        changed
    }

    // ---- inbound frames ----

    fn handle_message(&mut self, from: &PeerId, text: &str) {
        let frame = match WireMessage::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("malformed frame from {}: {}", from, e);
                metrics::record(|m| m.network.frames_malformed.inc());
                return;
            }
        };
        metrics::record(|m| m.network.frames_received.inc());
        match frame {
            WireMessage::StateUpdate { states } => self.apply_states(from, states),
        }
        self.emit_state_update();
    }

    fn apply_states(&mut self, from: &PeerId, states: FrameStates) {
        let now = self.clock.now_ms();
        let hosting = self.is_hosting();

        if !hosting {
            // A host frame is a full snapshot: anything it omits is gone
            let local = &self.local_id;
            self.remote.retain(|peer, _| states.contains_key(peer) && peer != local);
            for (peer, objects) in self.remote.iter_mut() {
                if let Some(incoming) = states.get(peer) {
                    objects.retain(|id, _| incoming.contains_key(id));
                }
            }
            let remote = &self.remote;
            self.last_activity
                .retain(|(peer, id), _| remote.get(peer).is_some_and(|o| o.contains_key(id)));
        }

        for (peer, objects) in states {
            if peer == self.local_id {
                continue;
            }
            if hosting {
                if !self.has_open_channel(&peer) {
                    debug!("rejecting {} entries for {} (no open channel)", objects.len(), peer);
                    metrics::record(|m| m.network.entries_rejected.inc_by(objects.len() as u64));
                    continue;
                }
                if peer == *from {
                    // Uplinks carry the sender's complete object set
                    if let Some(cached) = self.remote.get_mut(&peer) {
                        cached.retain(|id, _| objects.contains_key(id));
                    }
                }
            }
            for (object_id, state) in objects {
                self.apply_entry(&peer, object_id, state, now);
            }
        }
    }

    fn apply_entry(&mut self, peer: &PeerId, object_id: String, state: Value, now: Timestamp) {
        let objects = self.remote.entry(peer.clone()).or_default();
        match objects.get_mut(&object_id) {
            Some(existing) => {
                if !existing.update(state, now) {
                    trace!("stale snapshot for {}/{}", peer, object_id);
                }
            }
            None => {
                debug!("new remote object {}/{}", peer, object_id);
                let obj = RemoteObject::new(peer.clone(), object_id.clone(), state, now);
                objects.insert(object_id, obj);
            }
        }
    }
}

fn drop_signal(err: NegotiationError) -> Result<()> {
    debug!("dropping signal: {}", err);
    metrics::record(|m| m.signaling.envelopes_dropped.inc());
    Ok(())
}

#[cfg(test)]
mod tests;
