//! Peer transport contract
//!
//! A [`PeerLink`] is one peer connection carrying exactly one ordered,
//! reliable data channel. The initiator always creates the channel; the
//! responder receives it. Everything asynchronous a link observes is reported
//! through the [`Notify`] sink it was opened with, tagged with its [`LinkId`].

mod memory;

pub use memory::MemoryTransport;

use crate::core::{BoxFuture, Notify, PeerId, SessionConfig, TransportError};
use crate::signaling::{IceCandidate, SessionDescription};
use std::fmt;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Identifies one negotiation attempt with a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Connection settings every link of a session is opened with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSettings {
    /// Label of the data channel the initiator creates
    pub channel_label: String,
    /// STUN/TURN server urls used for candidate gathering
    pub ice_servers: Vec<String>,
}

impl From<&SessionConfig> for LinkSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            channel_label: config.channel_label.clone(),
            ice_servers: config.ice_servers.clone(),
        }
    }
}

/// Which side of the offer/answer exchange a link plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Creates the data channel and the offer
    Initiator,
    /// Receives the offer and the data channel
    Responder,
}

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, nothing negotiated
    New,
    /// ICE in progress
    Connecting,
    /// Transport established
    Connected,
    /// Connectivity lost
    Disconnected,
    /// ICE or DTLS failure
    Failed,
    /// Closed by either side
    Closed,
}

impl LinkState {
    /// Whether the link can no longer carry data
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed | LinkState::Closed)
    }
}

/// Something a link observed
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection state transition
    StateChanged(LinkState),
    /// A local candidate was gathered and must be forwarded to the remote side
    IceCandidate(IceCandidate),
    /// The data channel is open in both directions
    ChannelOpen,
    /// A text message arrived on the data channel
    Message(String),
    /// The data channel closed
    ChannelClosed,
}

/// A transport event and the link it came from
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    /// Producing link
    pub link: LinkId,
    /// Remote peer of that link
    pub remote: PeerId,
    /// What happened
    pub event: TransportEvent,
}

/// Factory for peer links
pub trait Transport: Send + Sync {
    /// Open a link from `local` to `remote`, reporting events to `sink`
    fn open(
        &self,
        local: &PeerId,
        remote: &PeerId,
        link: LinkId,
        role: NegotiationRole,
        settings: &LinkSettings,
        sink: Notify<LinkEvent>,
    ) -> TransportResult<Box<dyn PeerLink>>;
}

/// One peer connection and its data channel
pub trait PeerLink: Send {
    /// Id this link was opened with
    fn id(&self) -> LinkId;

    /// Create the data channel and a local offer (initiator only)
    fn create_offer(&mut self) -> BoxFuture<'_, TransportResult<SessionDescription>>;

    /// Apply a remote offer and create the local answer (responder only)
    fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> BoxFuture<'_, TransportResult<SessionDescription>>;

    /// Apply the remote answer (initiator only)
    fn apply_answer(&mut self, answer: SessionDescription) -> BoxFuture<'_, TransportResult<()>>;

    /// Add a remote ICE candidate
    fn add_ice_candidate(&mut self, candidate: IceCandidate) -> BoxFuture<'_, TransportResult<()>>;

    /// Send a text message on the data channel
    fn send(&self, text: &str) -> TransportResult<()>;

    /// Whether the data channel is open
    fn is_open(&self) -> bool;

    /// Close the connection; idempotent
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(LinkState::Failed.is_terminal());
        assert!(LinkState::Closed.is_terminal());
        assert!(LinkState::Disconnected.is_terminal());
        assert!(!LinkState::Connecting.is_terminal());
        assert!(!LinkState::Connected.is_terminal());
    }

    #[test]
    fn settings_follow_session_config() {
        let mut config = SessionConfig::default();
        config.channel_label = "race".into();
        config.ice_servers = vec!["stun:stun.example.org:3478".into()];
        let settings = LinkSettings::from(&config);
        assert_eq!(settings.channel_label, "race");
        assert_eq!(settings.ice_servers, vec!["stun:stun.example.org:3478".to_string()]);
    }
}
