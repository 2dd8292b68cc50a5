//! In-process loopback transport
//!
//! Links opened on the same [`MemoryTransport`] pair up by `(local, remote)`.
//! A pair connects once both ends hold a local and a remote description and
//! have each received at least one remote candidate, at which point both ends
//! report `Connected` followed by `ChannelOpen`.

use super::{
    LinkEvent, LinkId, LinkSettings, LinkState, NegotiationRole, PeerLink, Transport, TransportEvent,
    TransportResult,
};
use crate::core::{BoxFuture, Notify, PeerId, TransportError};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::ready;
use std::sync::Arc;
use tracing::{debug, trace};

type EndpointKey = (PeerId, PeerId);

struct Endpoint {
    link: LinkId,
    role: NegotiationRole,
    settings: LinkSettings,
    sink: Notify<LinkEvent>,
    local_description: Option<SdpType>,
    has_remote_description: bool,
    remote_candidates: usize,
    state: LinkState,
    channel_open: bool,
}

impl Endpoint {
    fn ready(&self) -> bool {
        self.local_description.is_some()
            && self.has_remote_description
            && self.remote_candidates > 0
            && !self.state.is_terminal()
            && self.state != LinkState::Connected
    }

    fn emit(&self, remote: &PeerId, event: TransportEvent) {
        (self.sink)(LinkEvent {
            link: self.link,
            remote: remote.clone(),
            event,
        });
    }
}

#[derive(Default)]
struct Fabric {
    endpoints: HashMap<EndpointKey, Endpoint>,
}

impl Fabric {
    fn endpoint_mut(&mut self, key: &EndpointKey, link: LinkId) -> TransportResult<&mut Endpoint> {
        match self.endpoints.get_mut(key) {
            Some(endpoint) if endpoint.link == link => Ok(endpoint),
            _ => Err(TransportError::InvalidState(format!("{} is closed", link))),
        }
    }

    fn try_connect(&mut self, local: &PeerId, remote: &PeerId) {
        let near_key = (local.clone(), remote.clone());
        let far_key = (remote.clone(), local.clone());
        let paired = match (self.endpoints.get(&near_key), self.endpoints.get(&far_key)) {
            (Some(near), Some(far)) => {
                near.ready()
                    && far.ready()
                    && near.role != far.role
                    && near.settings.channel_label == far.settings.channel_label
            }
            _ => false,
        };
        if !paired {
            return;
        }

        debug!("memory link {} <-> {} connected", local, remote);
        for (key, peer) in [(&near_key, remote), (&far_key, local)] {
            if let Some(endpoint) = self.endpoints.get_mut(key) {
                endpoint.state = LinkState::Connected;
                endpoint.channel_open = true;
                endpoint.emit(peer, TransportEvent::StateChanged(LinkState::Connected));
                endpoint.emit(peer, TransportEvent::ChannelOpen);
            }
        }
    }

    fn fail(&mut self, key: &EndpointKey, state: LinkState) {
        if let Some(endpoint) = self.endpoints.get_mut(key) {
            if endpoint.state.is_terminal() {
                return;
            }
            endpoint.state = state;
            if endpoint.channel_open {
                endpoint.channel_open = false;
                endpoint.emit(&key.1, TransportEvent::ChannelClosed);
            }
            endpoint.emit(&key.1, TransportEvent::StateChanged(state));
        }
    }
}

/// Loopback transport shared by every session in a process
#[derive(Clone, Default)]
pub struct MemoryTransport {
    fabric: Arc<Mutex<Fabric>>,
}

impl MemoryTransport {
    /// Create an empty fabric
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the connection between `a` and `b` on both ends
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let mut fabric = self.fabric.lock();
        fabric.fail(&(a.clone(), b.clone()), LinkState::Failed);
        fabric.fail(&(b.clone(), a.clone()), LinkState::Failed);
    }

    /// Whether `local`'s end of the link to `remote` has an open channel
    pub fn is_connected(&self, local: &PeerId, remote: &PeerId) -> bool {
        self.fabric
            .lock()
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .map(|endpoint| endpoint.channel_open)
            .unwrap_or(false)
    }

    /// Settings `local`'s end of the link to `remote` was opened with
    pub fn link_settings(&self, local: &PeerId, remote: &PeerId) -> Option<LinkSettings> {
        self.fabric
            .lock()
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .map(|endpoint| endpoint.settings.clone())
    }

    /// Number of link ends currently registered
    pub fn endpoint_count(&self) -> usize {
        self.fabric.lock().endpoints.len()
    }
}

impl Transport for MemoryTransport {
    fn open(
        &self,
        local: &PeerId,
        remote: &PeerId,
        link: LinkId,
        role: NegotiationRole,
        settings: &LinkSettings,
        sink: Notify<LinkEvent>,
    ) -> TransportResult<Box<dyn PeerLink>> {
        if local == remote {
            return Err(TransportError::ConnectionFailed(format!("{} cannot connect to itself", local)));
        }
        if settings.channel_label.is_empty() {
            return Err(TransportError::DataChannel("data channel label is empty".into()));
        }
        let endpoint = Endpoint {
            link,
            role,
            settings: settings.clone(),
            sink,
            local_description: None,
            has_remote_description: false,
            remote_candidates: 0,
            state: LinkState::New,
            channel_open: false,
        };
        // A re-opened link replaces the previous one without notifying it
        self.fabric
            .lock()
            .endpoints
            .insert((local.clone(), remote.clone()), endpoint);

        Ok(Box::new(MemoryLink {
            fabric: self.fabric.clone(),
            key: (local.clone(), remote.clone()),
            link,
            role,
        }))
    }
}

struct MemoryLink {
    fabric: Arc<Mutex<Fabric>>,
    key: EndpointKey,
    link: LinkId,
    role: NegotiationRole,
}

impl MemoryLink {
    fn description(&self, sdp_type: SdpType) -> SessionDescription {
        let sdp = format!("v=0\r\no=racenet {} {} {}\r\n", self.key.0, self.key.1, self.link.0);
        match sdp_type {
            SdpType::Offer => SessionDescription::offer(sdp),
            SdpType::Answer => SessionDescription::answer(sdp),
        }
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 memory {} typ host", self.link.0, self.key.0),
            sdp_m_line_index: Some(0),
            sdp_mid: Some("0".into()),
            username_fragment: None,
        }
    }

    fn expect_role(&self, role: NegotiationRole, operation: &str) -> TransportResult<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(TransportError::InvalidState(format!("{} on {:?} side", operation, self.role)))
        }
    }

    /// Set the local description and "gather" the single loopback candidate
    fn set_local(&self, sdp_type: SdpType, remote: Option<SessionDescription>) -> TransportResult<SessionDescription> {
        let mut fabric = self.fabric.lock();
        let candidate = self.local_candidate();
        let endpoint = fabric.endpoint_mut(&self.key, self.link)?;
        if endpoint.local_description.is_some() {
            return Err(TransportError::InvalidState("local description already set".into()));
        }
        if remote.is_some() {
            endpoint.has_remote_description = true;
        }
        endpoint.local_description = Some(sdp_type);
        endpoint.state = LinkState::Connecting;
        endpoint.emit(&self.key.1, TransportEvent::IceCandidate(candidate));
        fabric.try_connect(&self.key.0, &self.key.1);
        Ok(self.description(sdp_type))
    }

    fn answer_received(&self, answer: SessionDescription) -> TransportResult<()> {
        if answer.sdp_type != SdpType::Answer {
            return Err(TransportError::InvalidDescription("expected an answer".into()));
        }
        let mut fabric = self.fabric.lock();
        let endpoint = fabric.endpoint_mut(&self.key, self.link)?;
        if endpoint.local_description != Some(SdpType::Offer) || endpoint.has_remote_description {
            return Err(TransportError::InvalidState("no pending offer".into()));
        }
        endpoint.has_remote_description = true;
        fabric.try_connect(&self.key.0, &self.key.1);
        Ok(())
    }

    fn candidate_received(&self, candidate: IceCandidate) -> TransportResult<()> {
        if candidate.candidate.is_empty() {
            return Err(TransportError::InvalidDescription("empty candidate".into()));
        }
        let mut fabric = self.fabric.lock();
        let endpoint = fabric.endpoint_mut(&self.key, self.link)?;
        if !endpoint.has_remote_description {
            return Err(TransportError::InvalidState("candidate before remote description".into()));
        }
        endpoint.remote_candidates += 1;
        trace!("{} accepted candidate #{}", self.link, endpoint.remote_candidates);
        fabric.try_connect(&self.key.0, &self.key.1);
        Ok(())
    }
}

impl PeerLink for MemoryLink {
    fn id(&self) -> LinkId {
        self.link
    }

    fn create_offer(&mut self) -> BoxFuture<'_, TransportResult<SessionDescription>> {
        let result = self
            .expect_role(NegotiationRole::Initiator, "create_offer")
            .and_then(|_| self.set_local(SdpType::Offer, None));
        Box::pin(ready(result))
    }

    fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> BoxFuture<'_, TransportResult<SessionDescription>> {
        let result = self
            .expect_role(NegotiationRole::Responder, "accept_offer")
            .and_then(|_| {
                if offer.sdp_type != SdpType::Offer {
                    return Err(TransportError::InvalidDescription("expected an offer".into()));
                }
                self.set_local(SdpType::Answer, Some(offer))
            });
        Box::pin(ready(result))
    }

    fn apply_answer(&mut self, answer: SessionDescription) -> BoxFuture<'_, TransportResult<()>> {
        let result = self
            .expect_role(NegotiationRole::Initiator, "apply_answer")
            .and_then(|_| self.answer_received(answer));
        Box::pin(ready(result))
    }

    fn add_ice_candidate(&mut self, candidate: IceCandidate) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(ready(self.candidate_received(candidate)))
    }

    fn send(&self, text: &str) -> TransportResult<()> {
        let fabric = self.fabric.lock();
        let near = fabric
            .endpoints
            .get(&self.key)
            .filter(|endpoint| endpoint.link == self.link && endpoint.channel_open)
            .ok_or_else(|| TransportError::DataChannel(format!("{} has no open channel", self.link)))?;
        let far_key = (self.key.1.clone(), self.key.0.clone());
        let far = fabric
            .endpoints
            .get(&far_key)
            .filter(|endpoint| endpoint.channel_open)
            .ok_or_else(|| TransportError::DataChannel(format!("{} is not listening", self.key.1)))?;
        trace!("{} -> {}: {} bytes on {}", self.key.0, self.key.1, text.len(), near.link);
        far.emit(&self.key.0, TransportEvent::Message(text.to_string()));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.fabric
            .lock()
            .endpoints
            .get(&self.key)
            .map(|endpoint| endpoint.link == self.link && endpoint.channel_open)
            .unwrap_or(false)
    }

    fn close(&mut self) {
        let mut fabric = self.fabric.lock();
        let owned = fabric
            .endpoints
            .get(&self.key)
            .map(|endpoint| endpoint.link == self.link)
            .unwrap_or(false);
        if !owned {
            return;
        }
        let was_open = fabric
            .endpoints
            .remove(&self.key)
            .map(|endpoint| endpoint.channel_open)
            .unwrap_or(false);
        if was_open {
            let far_key = (self.key.1.clone(), self.key.0.clone());
            fabric.fail(&far_key, LinkState::Disconnected);
        }
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Seen = Arc<Mutex<Vec<LinkEvent>>>;

    fn settings() -> LinkSettings {
        LinkSettings::from(&crate::core::SessionConfig::default())
    }

    fn sink() -> (Seen, Notify<LinkEvent>) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let inner = seen.clone();
        (seen, Arc::new(move |event| inner.lock().push(event)))
    }

    fn candidates(seen: &Seen) -> Vec<IceCandidate> {
        seen.lock()
            .iter()
            .filter_map(|e| match &e.event {
                TransportEvent::IceCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn kinds(seen: &Seen) -> Vec<TransportEvent> {
        seen.lock()
            .iter()
            .filter(|e| !matches!(e.event, TransportEvent::IceCandidate(_)))
            .map(|e| e.event.clone())
            .collect()
    }

    async fn connected_pair(
        transport: &MemoryTransport,
    ) -> (Box<dyn PeerLink>, Box<dyn PeerLink>, Seen, Seen) {
        let a = PeerId::from("client_ab234");
        let b = PeerId::from("game_cd567");
        let (seen_a, sink_a) = sink();
        let (seen_b, sink_b) = sink();
        let mut link_a = transport.open(&a, &b, LinkId(1), NegotiationRole::Initiator, &settings(), sink_a).unwrap();
        let mut link_b = transport.open(&b, &a, LinkId(7), NegotiationRole::Responder, &settings(), sink_b).unwrap();

        let offer = link_a.create_offer().await.unwrap();
        let answer = link_b.accept_offer(offer).await.unwrap();
        link_a.apply_answer(answer).await.unwrap();
        for c in candidates(&seen_a) {
            link_b.add_ice_candidate(c).await.unwrap();
        }
        assert!(!link_a.is_open());
        for c in candidates(&seen_b) {
            link_a.add_ice_candidate(c).await.unwrap();
        }
        (link_a, link_b, seen_a, seen_b)
    }

    #[tokio::test]
    async fn negotiation_opens_channel_on_both_ends() {
        let transport = MemoryTransport::new();
        let (link_a, link_b, seen_a, seen_b) = connected_pair(&transport).await;

        assert!(link_a.is_open());
        assert!(link_b.is_open());
        let expected = vec![
            TransportEvent::StateChanged(LinkState::Connected),
            TransportEvent::ChannelOpen,
        ];
        assert_eq!(kinds(&seen_a), expected);
        assert_eq!(kinds(&seen_b), expected);
        assert!(seen_b.lock().iter().all(|e| e.link == LinkId(7)));
    }

    #[tokio::test]
    async fn messages_reach_far_side() {
        let transport = MemoryTransport::new();
        let (link_a, _link_b, _seen_a, seen_b) = connected_pair(&transport).await;

        link_a.send("hello").unwrap();
        let last = seen_b.lock().last().cloned().unwrap();
        assert_eq!(last.remote, PeerId::from("client_ab234"));
        assert_eq!(last.event, TransportEvent::Message("hello".into()));
    }

    #[tokio::test]
    async fn close_notifies_far_side_once() {
        let transport = MemoryTransport::new();
        let (mut link_a, link_b, _seen_a, seen_b) = connected_pair(&transport).await;

        link_a.close();
        link_a.close();
        assert!(!link_b.is_open());
        assert!(link_b.send("late").is_err());
        let tail: Vec<_> = kinds(&seen_b).into_iter().skip(2).collect();
        assert_eq!(
            tail,
            vec![
                TransportEvent::ChannelClosed,
                TransportEvent::StateChanged(LinkState::Disconnected)
            ]
        );
    }

    #[tokio::test]
    async fn sever_fails_both_ends() {
        let transport = MemoryTransport::new();
        let (link_a, link_b, seen_a, seen_b) = connected_pair(&transport).await;

        transport.sever(&PeerId::from("client_ab234"), &PeerId::from("game_cd567"));
        assert!(!link_a.is_open());
        assert!(!link_b.is_open());
        for seen in [&seen_a, &seen_b] {
            assert_eq!(
                kinds(seen).last(),
                Some(&TransportEvent::StateChanged(LinkState::Failed))
            );
        }
    }

    #[tokio::test]
    async fn out_of_order_calls_are_rejected() {
        let transport = MemoryTransport::new();
        let a = PeerId::from("client_ab234");
        let b = PeerId::from("game_cd567");
        let (_seen, sink_a) = sink();
        let mut link = transport.open(&a, &b, LinkId(1), NegotiationRole::Initiator, &settings(), sink_a).unwrap();

        assert!(matches!(
            link.apply_answer(SessionDescription::answer("v=0")).await,
            Err(TransportError::InvalidState(_))
        ));
        assert!(matches!(
            link.accept_offer(SessionDescription::offer("v=0")).await,
            Err(TransportError::InvalidState(_))
        ));
        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_m_line_index: None,
            sdp_mid: None,
            username_fragment: None,
        };
        assert!(link.add_ice_candidate(candidate).await.is_err());
    }

    #[tokio::test]
    async fn superseded_link_goes_quiet() {
        let transport = MemoryTransport::new();
        let a = PeerId::from("client_ab234");
        let b = PeerId::from("game_cd567");
        let (_seen, first_sink) = sink();
        let mut first = transport.open(&a, &b, LinkId(1), NegotiationRole::Initiator, &settings(), first_sink).unwrap();
        let (_seen, second_sink) = sink();
        let _second = transport.open(&a, &b, LinkId(2), NegotiationRole::Initiator, &settings(), second_sink).unwrap();

        assert!(first.create_offer().await.is_err());
        first.close();
        assert_eq!(transport.endpoint_count(), 1);
    }

    #[tokio::test]
    async fn links_keep_their_settings() {
        let transport = MemoryTransport::new();
        let _pair = connected_pair(&transport).await;
        let a = PeerId::from("client_ab234");
        let b = PeerId::from("game_cd567");

        let recorded = transport.link_settings(&a, &b).unwrap();
        assert_eq!(recorded.channel_label, "gameData");
        assert!(!recorded.ice_servers.is_empty());

        let (_seen, sink_c) = sink();
        let unlabeled = LinkSettings::default();
        let c = PeerId::from("client_ef789");
        assert!(transport
            .open(&c, &b, LinkId(3), NegotiationRole::Initiator, &unlabeled, sink_c)
            .is_err());
    }

    #[tokio::test]
    async fn mismatched_channel_labels_never_connect() {
        let transport = MemoryTransport::new();
        let a = PeerId::from("client_ab234");
        let b = PeerId::from("game_cd567");
        let (seen_a, sink_a) = sink();
        let (seen_b, sink_b) = sink();
        let other = LinkSettings {
            channel_label: "chat".into(),
            ..settings()
        };
        let mut link_a = transport.open(&a, &b, LinkId(1), NegotiationRole::Initiator, &settings(), sink_a).unwrap();
        let mut link_b = transport.open(&b, &a, LinkId(2), NegotiationRole::Responder, &other, sink_b).unwrap();

        let offer = link_a.create_offer().await.unwrap();
        let answer = link_b.accept_offer(offer).await.unwrap();
        link_a.apply_answer(answer).await.unwrap();
        for c in candidates(&seen_a) {
            link_b.add_ice_candidate(c).await.unwrap();
        }
        for c in candidates(&seen_b) {
            link_a.add_ice_candidate(c).await.unwrap();
        }
        assert!(!link_a.is_open());
        assert!(!link_b.is_open());
    }
}
