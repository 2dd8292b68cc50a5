use super::*;
use crate::core::{BoxFuture, ManualClock, TransportError};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::transport::{LinkSettings, TransportResult};
use parking_lot::Mutex;
use serde_json::json;
use std::future::ready;

const NOW: u64 = 1_700_000_000_000;

type Outbox = Arc<Mutex<BTreeMap<PeerId, Vec<String>>>>;

/// Transport whose links accept every call and record what they send
#[derive(Clone, Default)]
struct RecordingTransport {
    outbox: Outbox,
    closed: Arc<Mutex<Vec<LinkId>>>,
    opened: Arc<Mutex<Vec<LinkSettings>>>,
}

struct RecordingLink {
    id: LinkId,
    remote: PeerId,
    outbox: Outbox,
    closed: Arc<Mutex<Vec<LinkId>>>,
}

impl Transport for RecordingTransport {
    fn open(
        &self,
        _local: &PeerId,
        remote: &PeerId,
        link: LinkId,
        _role: NegotiationRole,
        settings: &LinkSettings,
        _sink: Notify<LinkEvent>,
    ) -> TransportResult<Box<dyn PeerLink>> {
        self.opened.lock().push(settings.clone());
        Ok(Box::new(RecordingLink {
            id: link,
            remote: remote.clone(),
            outbox: self.outbox.clone(),
            closed: self.closed.clone(),
        }))
    }
}

impl PeerLink for RecordingLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn create_offer(&mut self) -> BoxFuture<'_, TransportResult<SessionDescription>> {
        Box::pin(ready(Ok(SessionDescription::offer("v=0 offer"))))
    }

    fn accept_offer(&mut self, _offer: SessionDescription) -> BoxFuture<'_, TransportResult<SessionDescription>> {
        Box::pin(ready(Ok(SessionDescription::answer("v=0 answer"))))
    }

    fn apply_answer(&mut self, _answer: SessionDescription) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(ready(Ok(())))
    }

    fn add_ice_candidate(&mut self, candidate: IceCandidate) -> BoxFuture<'_, TransportResult<()>> {
        let result = if candidate.candidate.is_empty() {
            Err(TransportError::InvalidDescription("empty".into()))
        } else {
            Ok(())
        };
        Box::pin(ready(result))
    }

    fn send(&self, text: &str) -> TransportResult<()> {
        self.outbox
            .lock()
            .entry(self.remote.clone())
            .or_default()
            .push(text.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.lock().contains(&self.id)
    }

    fn close(&mut self) {
        self.closed.lock().push(self.id);
    }
}

#[derive(Default)]
struct RecordingRelay {
    signals: Mutex<Vec<(PeerId, PeerSignal)>>,
}

impl SignalRelay for RecordingRelay {
    fn send_signal(&self, to: &PeerId, signal: PeerSignal) -> BoxFuture<'_, Result<()>> {
        self.signals.lock().push((to.clone(), signal));
        Box::pin(ready(Ok(())))
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    transport: RecordingTransport,
    relay: RecordingRelay,
    manager: NetworkManager,
}

impl Harness {
    fn new(local: &str, role: Role) -> Self {
        let clock = Arc::new(ManualClock::new(NOW));
        let transport = RecordingTransport::default();
        let sink: Notify<LinkEvent> = Arc::new(|_| {});
        let mut manager = NetworkManager::new(
            SessionConfig::default(),
            Arc::new(transport.clone()),
            clock.clone(),
            PeerId::from(local),
            sink,
        );
        manager.set_identity(PeerId::from(local), role);
        Self {
            clock,
            transport,
            relay: RecordingRelay::default(),
            manager,
        }
    }

    fn host() -> Self {
        Self::new("game_ab234", Role::Host)
    }

    fn client_of(host: &str) -> Self {
        Self::new(
            "client_cd567",
            Role::Client {
                host: PeerId::from(host),
            },
        )
    }

    async fn event(&mut self, peer: &PeerId, event: TransportEvent) -> Option<PeerId> {
        let link = self.manager.connection(peer).map(|c| c.link_id()).unwrap_or(LinkId(0));
        self.manager
            .on_link_event(
                LinkEvent {
                    link,
                    remote: peer.clone(),
                    event,
                },
                &self.relay,
            )
            .await
    }

    /// Accept an inbound connection from `peer` and open its channel
    async fn accept(&mut self, peer: &str) -> PeerId {
        let peer = PeerId::from(peer);
        self.manager
            .handle_peer_signal(peer.clone(), PeerSignal::Offer(SessionDescription::offer("v=0")), &self.relay)
            .await
            .unwrap();
        self.event(&peer, TransportEvent::StateChanged(LinkState::Connected)).await;
        self.event(&peer, TransportEvent::ChannelOpen).await;
        peer
    }

    async fn receive(&mut self, from: &PeerId, states: serde_json::Value) {
        let text = json!({ "type": "state-update", "states": states }).to_string();
        self.event(from, TransportEvent::Message(text)).await;
    }

    fn sent_to(&self, peer: &PeerId) -> Vec<String> {
        self.transport.outbox.lock().get(peer).cloned().unwrap_or_default()
    }

    fn clear_outbox(&self) {
        self.transport.outbox.lock().clear();
    }
}

fn car(x: i64) -> LocalSender {
    LocalSender::new("car", move || json!({ "x": x }))
}

#[tokio::test]
async fn host_broadcasts_identical_composite_frame() {
    let mut h = Harness::host();
    h.manager.add_sender(car(1));
    let b = h.accept("client_bb222").await;
    let c = h.accept("client_cc333").await;
    h.receive(&b, json!({ "client_bb222": { "0": { "type": "car", "x": 2, "lastUpdate": NOW } } }))
        .await;
    h.receive(&c, json!({ "client_cc333": { "0": { "type": "car", "x": 3, "lastUpdate": NOW } } }))
        .await;
    h.clear_outbox();

    assert_eq!(h.manager.broadcast_states(), 2);

    let to_b = h.sent_to(&b);
    let to_c = h.sent_to(&c);
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_b, to_c);
    let frame = WireMessage::decode(&to_b[0]).unwrap();
    assert_eq!(frame.entry_count(), 3);

    let value: serde_json::Value = serde_json::from_str(&to_b[0]).unwrap();
    assert_eq!(value["states"]["game_ab234"]["0"]["x"], 1);
    assert_eq!(value["states"]["client_bb222"]["0"]["active"], true);
}

#[tokio::test]
async fn client_without_senders_sends_nothing() {
    let mut h = Harness::client_of("game_ab234");
    let host = PeerId::from("game_ab234");
    h.manager.initiate_connection(&host, &h.relay).await.unwrap();
    h.event(&host, TransportEvent::ChannelOpen).await;

    assert!(!h.manager.send_state_to_host());
    h.manager.tick();
    assert!(h.sent_to(&host).is_empty());

    h.manager.add_sender(car(5));
    assert!(h.manager.send_state_to_host());
    let sent = h.sent_to(&host);
    let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(value["states"]["client_cd567"]["0"]["lastUpdate"], NOW);
}

#[tokio::test]
async fn client_uplink_never_relays_remote_objects() {
    let mut h = Harness::client_of("game_ab234");
    let host = PeerId::from("game_ab234");
    h.manager.initiate_connection(&host, &h.relay).await.unwrap();
    h.event(&host, TransportEvent::ChannelOpen).await;
    h.receive(&host, json!({ "game_ab234": { "0": { "type": "car", "lastUpdate": NOW } } }))
        .await;
    h.manager.add_sender(car(5));

    h.manager.tick();
    let frame = WireMessage::decode(&h.sent_to(&host)[0]).unwrap();
    assert_eq!(frame.entry_count(), 1);
}

#[tokio::test]
async fn host_rejects_entries_for_peers_without_channel() {
    let mut h = Harness::host();
    let b = h.accept("client_bb222").await;
    h.receive(
        &b,
        json!({
            "client_bb222": { "0": { "type": "car", "lastUpdate": NOW } },
            "client_zz999": { "0": { "type": "car", "lastUpdate": NOW } }
        }),
    )
    .await;

    assert!(h.manager.remote_object(&b, "0").is_some());
    assert!(h.manager.remote_object(&PeerId::from("client_zz999"), "0").is_none());
}

#[tokio::test]
async fn receiver_skips_its_own_entries() {
    let mut h = Harness::client_of("game_ab234");
    let host = PeerId::from("game_ab234");
    h.manager.initiate_connection(&host, &h.relay).await.unwrap();
    h.event(&host, TransportEvent::ChannelOpen).await;
    h.receive(
        &host,
        json!({
            "game_ab234": { "0": { "x": 1, "lastUpdate": NOW } },
            "client_cd567": { "0": { "x": 9, "lastUpdate": NOW } }
        }),
    )
    .await;
    assert!(h.manager.remote_object(&PeerId::from("client_cd567"), "0").is_none());
    assert!(h.manager.remote_object(&host, "0").is_some());
}

#[tokio::test]
async fn disconnect_twice_is_a_no_op() {
    let mut h = Harness::host();
    h.manager.add_sender(car(1));
    let b = h.accept("client_bb222").await;
    let c = h.accept("client_cc333").await;
    h.receive(&b, json!({ "client_bb222": { "0": { "x": 2, "lastUpdate": NOW } } })).await;
    h.clear_outbox();

    assert!(h.manager.handle_disconnect(&b));
    // survivors hear about the departure right away
    let frame = WireMessage::decode(&h.sent_to(&c)[0]).unwrap();
    assert_eq!(frame.entry_count(), 1);

    let states = h.manager.get_states();
    let peers = h.manager.get_connected_peers();
    h.clear_outbox();
    assert!(!h.manager.handle_disconnect(&b));
    assert_eq!(h.manager.get_states(), states);
    assert_eq!(h.manager.get_connected_peers(), peers);
    assert!(h.sent_to(&c).is_empty());
}

#[tokio::test]
async fn terminal_link_state_tears_down_once() {
    let mut h = Harness::host();
    let b = h.accept("client_bb222").await;

    assert_eq!(h.event(&b, TransportEvent::ChannelClosed).await, Some(b.clone()));
    assert_eq!(h.event(&b, TransportEvent::StateChanged(LinkState::Failed)).await, None);
    assert!(h.manager.connection(&b).is_none());
    assert_eq!(h.transport.closed.lock().len(), 1);
}

#[tokio::test]
async fn superseded_link_events_are_ignored() {
    let mut h = Harness::host();
    let b = h.accept("client_bb222").await;
    let stale = h.manager.connection(&b).unwrap().link_id();
    // peer re-offers; the old link is closed and replaced
    h.manager
        .handle_peer_signal(b.clone(), PeerSignal::Offer(SessionDescription::offer("v=0")), &h.relay)
        .await
        .unwrap();
    assert_ne!(h.manager.connection(&b).unwrap().link_id(), stale);

    let outcome = h
        .manager
        .on_link_event(
            LinkEvent {
                link: stale,
                remote: b.clone(),
                event: TransportEvent::ChannelClosed,
            },
            &h.relay,
        )
        .await;
    assert_eq!(outcome, None);
    assert!(h.manager.connection(&b).is_some());
}

#[tokio::test]
async fn signals_without_connection_are_dropped() {
    let mut h = Harness::host();
    let stranger = PeerId::from("client_zz999");
    let answer = h
        .manager
        .handle_peer_signal(stranger.clone(), PeerSignal::Answer(SessionDescription::answer("v=0")), &h.relay)
        .await;
    assert!(answer.is_ok());
    let candidate = IceCandidate {
        candidate: "candidate:1".into(),
        sdp_m_line_index: Some(0),
        sdp_mid: None,
        username_fragment: None,
    };
    let ice = h
        .manager
        .handle_peer_signal(stranger.clone(), PeerSignal::IceCandidate(candidate), &h.relay)
        .await;
    assert!(ice.is_ok());
    assert!(h.manager.connection(&stranger).is_none());
}

#[tokio::test]
async fn answer_after_connect_is_out_of_order() {
    let mut h = Harness::client_of("game_ab234");
    let host = PeerId::from("game_ab234");
    h.manager.initiate_connection(&host, &h.relay).await.unwrap();
    h.event(&host, TransportEvent::StateChanged(LinkState::Connected)).await;

    let result = h
        .manager
        .handle_peer_signal(host.clone(), PeerSignal::Answer(SessionDescription::answer("v=0")), &h.relay)
        .await;
    assert!(result.is_ok());
    assert_eq!(h.manager.connection(&host).unwrap().state(), ConnectionState::Connected);
}

#[tokio::test]
async fn negotiation_relays_offer_answer_and_candidates() {
    let mut h = Harness::client_of("game_ab234");
    let host = PeerId::from("game_ab234");
    h.manager.initiate_connection(&host, &h.relay).await.unwrap();
    assert_eq!(h.manager.connection(&host).unwrap().state(), ConnectionState::Offering);
    assert_eq!(h.manager.connection(&host).unwrap().role(), NegotiationRole::Initiator);

    let candidate = IceCandidate {
        candidate: "candidate:2".into(),
        sdp_m_line_index: Some(0),
        sdp_mid: Some("0".into()),
        username_fragment: None,
    };
    h.event(&host, TransportEvent::IceCandidate(candidate)).await;

    let signals = h.relay.signals.lock();
    assert_eq!(signals.len(), 2);
    assert!(matches!(signals[0].1, PeerSignal::Offer(_)));
    assert!(matches!(signals[1].1, PeerSignal::IceCandidate(_)));
    assert!(signals.iter().all(|(to, _)| *to == host));
}

#[tokio::test]
async fn links_open_with_configured_channel_and_ice_servers() {
    let mut h = Harness::client_of("game_ab234");
    let host = PeerId::from("game_ab234");
    h.manager.initiate_connection(&host, &h.relay).await.unwrap();

    let opened = h.transport.opened.lock();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0], LinkSettings::from(&SessionConfig::default()));
    assert_eq!(opened[0].channel_label, "gameData");
}

#[tokio::test]
async fn sweep_broadcasts_on_activity_edges() {
    let mut h = Harness::host();
    let b = h.accept("client_bb222").await;
    h.receive(&b, json!({ "client_bb222": { "0": { "x": 2, "lastUpdate": NOW } } })).await;

    h.clock.advance(4_999);
    assert!(!h.manager.check_inactive_peers());

    h.clock.advance(2);
    h.clear_outbox();
    assert!(h.manager.check_inactive_peers());
    let value: serde_json::Value = serde_json::from_str(&h.sent_to(&b)[0]).unwrap();
    assert_eq!(value["states"]["client_bb222"]["0"]["active"], false);

    // no new edge, no new broadcast
    assert!(!h.manager.check_inactive_peers());

    h.receive(&b, json!({ "client_bb222": { "0": { "x": 3, "lastUpdate": NOW + 5_001 } } }))
        .await;
    assert!(h.manager.check_inactive_peers());
    assert!(h.manager.get_states()[&b].active);
}

#[tokio::test]
async fn client_prunes_what_host_frame_omits() {
    let mut h = Harness::client_of("game_ab234");
    let host = PeerId::from("game_ab234");
    h.manager.initiate_connection(&host, &h.relay).await.unwrap();
    h.event(&host, TransportEvent::ChannelOpen).await;

    h.receive(
        &host,
        json!({
            "game_ab234": { "0": { "x": 1, "lastUpdate": NOW }, "1": { "x": 1, "lastUpdate": NOW } },
            "client_ee444": { "0": { "x": 4, "lastUpdate": NOW } }
        }),
    )
    .await;
    assert_eq!(h.manager.get_states().len(), 2);

    h.receive(&host, json!({ "game_ab234": { "0": { "x": 1, "lastUpdate": NOW + 50 } } }))
        .await;
    let states = h.manager.get_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[&host].objects.len(), 1);
}

#[tokio::test]
async fn host_replaces_uplinker_object_set() {
    let mut h = Harness::host();
    let b = h.accept("client_bb222").await;
    h.receive(
        &b,
        json!({ "client_bb222": { "0": { "lastUpdate": NOW }, "1": { "lastUpdate": NOW } } }),
    )
    .await;
    h.receive(&b, json!({ "client_bb222": { "1": { "lastUpdate": NOW + 50 } } })).await;

    assert!(h.manager.remote_object(&b, "0").is_none());
    assert!(h.manager.remote_object(&b, "1").is_some());
}

#[tokio::test]
async fn malformed_frame_is_skipped() {
    let mut h = Harness::host();
    let b = h.accept("client_bb222").await;
    h.event(&b, TransportEvent::Message("{\"type\":\"state-update\",".into())).await;
    h.event(&b, TransportEvent::Message("{\"type\":\"chat\"}".into())).await;
    assert!(h.manager.connection(&b).is_some());
    assert!(h.manager.get_states().is_empty());
}

#[tokio::test]
async fn listeners_receive_updates_and_peer_changes() {
    let mut h = Harness::host();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let peers = Arc::new(Mutex::new(Vec::new()));
    {
        let updates = updates.clone();
        h.manager.on(NetworkEventKind::StateUpdate, move |event| {
            if let NetworkEvent::StateUpdate(states) = event {
                updates.lock().push(states.clone());
            }
        });
        let peers = peers.clone();
        h.manager.on(NetworkEventKind::PeersChanged, move |event| {
            if let NetworkEvent::PeersChanged(list) = event {
                peers.lock().push(list.clone());
            }
        });
    }

    let b = h.accept("client_bb222").await;
    h.receive(&b, json!({ "client_bb222": { "0": { "x": 2, "lastUpdate": NOW } } })).await;
    assert_eq!(peers.lock().last().unwrap(), &vec![b.clone()]);
    let last = updates.lock().last().cloned().unwrap();
    assert_eq!(last[&b].objects["0"]["x"], 2);

    h.manager.handle_disconnect(&b);
    assert!(peers.lock().last().unwrap().is_empty());
}

#[tokio::test]
async fn get_states_marks_local_peer_active() {
    let mut h = Harness::host();
    let id = h.manager.add_sender(car(1));
    assert_eq!(id, 0);
    assert_eq!(h.manager.add_sender(car(2)), 1);

    h.clock.advance(60_000);
    let states = h.manager.get_states();
    let own = &states[&PeerId::from("game_ab234")];
    assert!(own.active);
    assert_eq!(own.objects.len(), 2);

    assert!(h.manager.remove_sender(id));
    assert!(!h.manager.remove_sender(id));
    assert_eq!(h.manager.sender_count(), 1);
}

#[tokio::test]
async fn reset_keeps_senders_cleanup_drops_them() {
    let mut h = Harness::host();
    h.manager.add_sender(car(1));
    let b = h.accept("client_bb222").await;
    h.manager.on(NetworkEventKind::Log, |_| {});

    h.manager.reset_connections();
    assert!(h.manager.connection(&b).is_none());
    assert_eq!(h.manager.sender_count(), 1);

    h.manager.cleanup();
    assert_eq!(h.manager.sender_count(), 0);
    assert_eq!(h.manager.add_sender(car(3)), 0);
}
