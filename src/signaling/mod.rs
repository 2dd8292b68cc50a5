//! Role election and handshake relay
//!
//! The [`SignalingManager`] decides whether this node hosts or joins, keeps
//! the host's ServerRecord alive, and moves offer/answer/ICE envelopes
//! through the current host's mailbox. It never touches peer connections
//! itself: decoded signals are handed back to the caller, and connection code
//! sends through the [`SignalRelay`] seam.
//!
//! Every directory subscription is tagged with the manager's epoch. The epoch
//! moves on each role transition, so notifications from a torn-down
//! subscription that are still queued are recognised and ignored.

mod envelope;

pub use envelope::{IceCandidate, PeerSignal, SdpType, SessionDescription, SignalKind, SignalingEnvelope};

use crate::core::{
    BoxFuture, Clock, DirectoryError, Notify, PeerId, Result, Role, RolePrefix, SessionConfig,
};
use crate::directory::{DirectoryService, EnvelopeId, RecordChange, ServerRecord, StoredEnvelope, SubscriptionId};
use crate::system::metrics;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Notifications the signaling layer needs delivered back to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// An envelope addressed to this node appeared in a mailbox
    Mailbox {
        /// Subscription epoch
        epoch: u64,
        /// The envelope
        stored: StoredEnvelope,
    },
    /// The watched host record changed
    HostRecord {
        /// Subscription epoch
        epoch: u64,
        /// New existence state
        change: RecordChange,
    },
    /// The post-disconnect pause elapsed
    Rediscover {
        /// Epoch the pause was scheduled in
        epoch: u64,
    },
    /// The grace period after losing the host link elapsed
    HostGrace {
        /// Epoch the grace period was scheduled in
        epoch: u64,
        /// Host whose link was lost
        host: PeerId,
    },
}

/// Result of a discovery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// No usable record existed; this node now hosts
    BecameHost,
    /// A fresh record was found; this node joined it as a client
    Joined {
        /// The host to connect to
        host: PeerId,
    },
    /// Another discovery was already running
    Skipped,
}

/// Result of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Not hosting; nothing to refresh
    Idle,
    /// Record refreshed (or re-created)
    Refreshed,
    /// Stepped down in favour of a fresher host; the caller should fail over
    Yielded,
}

/// Outbound half of signaling, as seen by connection code
pub trait SignalRelay: Send + Sync {
    /// Deliver `signal` to `to` through the active host's mailbox
    fn send_signal(&self, to: &PeerId, signal: PeerSignal) -> BoxFuture<'_, Result<()>>;
}

/// Host election, heartbeat and mailbox relay for one node
pub struct SignalingManager {
    config: SessionConfig,
    directory: Arc<dyn DirectoryService>,
    clock: Arc<dyn Clock>,
    sink: Notify<SignalingEvent>,
    peer_id: PeerId,
    role: Role,
    discovering: bool,
    epoch: u64,
    subscriptions: Vec<SubscriptionId>,
    consumed: HashSet<EnvelopeId>,
}

impl SignalingManager {
    /// Create a manager in the undetermined role
    pub fn new(
        config: SessionConfig,
        directory: Arc<dyn DirectoryService>,
        clock: Arc<dyn Clock>,
        sink: Notify<SignalingEvent>,
    ) -> Self {
        Self {
            config,
            directory,
            clock,
            sink,
            peer_id: PeerId::mint(RolePrefix::Host),
            role: Role::Undetermined,
            discovering: false,
            epoch: 0,
            subscriptions: Vec::new(),
            consumed: HashSet::new(),
        }
    }

    /// This node's current id
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// This node's current role
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Current subscription epoch
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a discovery call is in flight
    pub fn is_discovering(&self) -> bool {
        self.discovering
    }

    /// Join the freshest host, or become one.
    ///
    /// Directory failures fall through to hosting.
    pub async fn discover_or_become_host(&mut self) -> DiscoveryOutcome {
        if self.discovering {
            debug!("discovery already in progress");
            return DiscoveryOutcome::Skipped;
        }
        self.discovering = true;
        let outcome = self.discover().await;
        self.discovering = false;
        outcome
    }

    async fn discover(&mut self) -> DiscoveryOutcome {
        let max_age = self.config.max_server_age_ms();
        match self.directory.latest_server().await {
            Ok(Some(record)) => {
                let now = self.clock.now_ms();
                if record.joinable && record.is_fresh(now, max_age) && record.id != self.peer_id {
                    info!("found active host {} ({}ms old), joining", record.id, record.age_ms(now));
                    self.join_host(&record)
                } else {
                    info!(
                        "latest host {} is unusable ({}ms old), hosting",
                        record.id,
                        record.age_ms(now)
                    );
                    self.become_host().await
                }
            }
            Ok(None) => {
                info!("no hosts advertised, hosting");
                self.become_host().await
            }
            Err(e) => {
                warn!("discovery failed, hosting: {}", e);
                metrics::record(|m| m.discovery.discovery_failures.inc());
                self.become_host().await
            }
        }
    }

    /// Mint a host id, advertise it and listen on our own mailbox
    pub async fn become_host(&mut self) -> DiscoveryOutcome {
        self.begin_epoch();
        self.peer_id = PeerId::mint(RolePrefix::Host);

        if let Err(e) = self.directory.create_server(&self.peer_id).await {
            // Hosting unlisted still serves anyone already holding our id
            warn!("could not advertise {}: {}", self.peer_id, e);
        }
        self.role = Role::Host;

        let me = self.peer_id.clone();
        self.subscribe_mailbox(&me);

        info!("became host {}", self.peer_id);
        metrics::record(|m| m.discovery.elected_host.inc());
        DiscoveryOutcome::BecameHost
    }

    /// Mint a client id and subscribe to `record`'s mailbox and existence
    pub fn join_host(&mut self, record: &ServerRecord) -> DiscoveryOutcome {
        self.begin_epoch();
        self.peer_id = PeerId::mint(RolePrefix::Client);
        self.role = Role::Client {
            host: record.id.clone(),
        };

        self.subscribe_mailbox(&record.id);

        let sink = self.sink.clone();
        let epoch = self.epoch;
        let watch: Notify<RecordChange> =
            Arc::new(move |change| sink(SignalingEvent::HostRecord { epoch, change }));
        match self.directory.watch_server(&record.id, watch) {
            Ok(sub) => self.subscriptions.push(sub),
            Err(e) => {
                // Without a watch a later deletion would go unnoticed
                warn!("cannot watch host {}, treating it as gone: {}", record.id, e);
                (self.sink)(SignalingEvent::HostRecord {
                    epoch,
                    change: RecordChange::Deleted,
                });
            }
        }

        info!("joining host {} as {}", record.id, self.peer_id);
        metrics::record(|m| m.discovery.joined_host.inc());
        DiscoveryOutcome::Joined {
            host: record.id.clone(),
        }
    }

    fn subscribe_mailbox(&mut self, host: &PeerId) {
        let sink = self.sink.clone();
        let epoch = self.epoch;
        let mailbox: Notify<StoredEnvelope> =
            Arc::new(move |stored| sink(SignalingEvent::Mailbox { epoch, stored }));
        match self.directory.subscribe_mailbox(host, &self.peer_id, mailbox) {
            Ok(sub) => self.subscriptions.push(sub),
            Err(e) => warn!("cannot subscribe to mailbox of {}: {}", host, e),
        }
    }

    /// Drop every subscription and start a new epoch
    fn begin_epoch(&mut self) {
        for sub in self.subscriptions.drain(..) {
            self.directory.unsubscribe(sub);
        }
        self.consumed.clear();
        self.epoch += 1;
    }

    /// Mailbox that envelopes for and from this node go through
    pub fn active_mailbox(&self) -> Option<&PeerId> {
        match &self.role {
            Role::Host => Some(&self.peer_id),
            Role::Client { host } => Some(host),
            Role::Undetermined => None,
        }
    }

    /// Post `signal` for `to`, stamped with our id
    pub async fn send_signaling(&self, to: &PeerId, signal: PeerSignal) -> Result<()> {
        self.post(to, signal).await
    }

    fn post(&self, to: &PeerId, signal: PeerSignal) -> BoxFuture<'static, Result<()>> {
        let host = match self.active_mailbox() {
            Some(host) => host.clone(),
            None => {
                let err = DirectoryError::Delivery(format!("no active host for {}", signal.kind().as_str()));
                return Box::pin(std::future::ready(Err(err.into())));
            }
        };
        let envelope = SignalingEnvelope::new(self.peer_id.clone(), to.clone(), signal);
        let directory = self.directory.clone();
        Box::pin(async move {
            debug!("sending {} {} -> {}", envelope.kind.as_str(), envelope.from, envelope.to);
            directory.post_envelope(&host, envelope).await?;
            metrics::record(|m| m.signaling.envelopes_sent.inc());
            Ok(())
        })
    }

    /// Consume a mailbox notification.
    ///
    /// Returns the sender and decoded signal when the envelope is current and
    /// seen for the first time. The envelope is deleted either way.
    pub async fn handle_signaling(&mut self, epoch: u64, stored: StoredEnvelope) -> Option<(PeerId, PeerSignal)> {
        if epoch != self.epoch || stored.envelope.to != self.peer_id {
            debug!("ignoring envelope {} from a previous role", stored.id);
            return None;
        }
        if !self.consumed.insert(stored.id) {
            debug!("duplicate delivery of envelope {}", stored.id);
            metrics::record(|m| m.signaling.envelopes_dropped.inc());
            return None;
        }

        let decoded = stored.envelope.signal();
        if let Err(e) = self.directory.delete_envelope(&stored.host, stored.id).await {
            warn!("could not delete envelope {}: {}", stored.id, e);
        }

        match decoded {
            Ok(signal) => {
                debug!("received {} from {}", signal.kind().as_str(), stored.envelope.from);
                metrics::record(|m| m.signaling.envelopes_consumed.inc());
                Some((stored.envelope.from, signal))
            }
            Err(e) => {
                warn!("dropping envelope {}: {}", stored.id, e);
                metrics::record(|m| m.signaling.envelopes_dropped.inc());
                None
            }
        }
    }

    /// Interpret a host record notification; true when the host is gone
    pub fn host_record_changed(&self, epoch: u64, change: &RecordChange) -> bool {
        if epoch != self.epoch || self.role.host().is_none() {
            return false;
        }
        match change {
            RecordChange::Present(_) => false,
            RecordChange::Deleted => {
                info!("host record deleted");
                true
            }
        }
    }

    /// Tear down subscriptions, forget the role and schedule rediscovery
    pub fn handle_disconnect(&mut self) {
        self.begin_epoch();
        self.role = Role::Undetermined;
        metrics::record(|m| m.discovery.failovers.inc());
        info!("disconnected, rediscovering in {:?}", self.config.rediscover_delay);
        let epoch = self.epoch;
        self.schedule(self.config.rediscover_delay, SignalingEvent::Rediscover { epoch });
    }

    /// Whether a rediscovery timer is still wanted
    pub fn should_rediscover(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.role == Role::Undetermined
    }

    /// Start the grace period for a lost link to `host`
    pub fn schedule_host_grace(&self, host: PeerId) {
        debug!("host {} unreachable, waiting {:?}", host, self.config.host_unreachable_grace);
        let epoch = self.epoch;
        self.schedule(
            self.config.host_unreachable_grace,
            SignalingEvent::HostGrace { epoch, host },
        );
    }

    /// Whether an expired grace period still concerns our current host
    pub fn grace_applies(&self, epoch: u64, host: &PeerId) -> bool {
        epoch == self.epoch && self.role.host() == Some(host)
    }

    fn schedule(&self, delay: Duration, event: SignalingEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink(event);
        });
    }

    /// Refresh our ServerRecord while hosting.
    ///
    /// An idle host (`connected_peers == 0`) that finds a different, fresher,
    /// joinable record steps down so double elections converge.
    pub async fn heartbeat(&mut self, connected_peers: usize) -> HeartbeatOutcome {
        if !self.role.is_host() {
            return HeartbeatOutcome::Idle;
        }

        if self.config.yield_to_fresher_host && connected_peers == 0 {
            if let Ok(Some(rival)) = self.directory.latest_server().await {
                let now = self.clock.now_ms();
                if rival.id != self.peer_id
                    && rival.joinable
                    && rival.is_fresh(now, self.config.max_server_age_ms())
                {
                    info!("yielding host role to fresher host {}", rival.id);
                    if let Err(e) = self.directory.delete_server(&self.peer_id).await {
                        warn!("could not withdraw {}: {}", self.peer_id, e);
                    }
                    metrics::record(|m| m.discovery.host_yields.inc());
                    return HeartbeatOutcome::Yielded;
                }
            }
        }

        match self.directory.touch_server(&self.peer_id).await {
            Ok(_) => debug!("heartbeat {}", self.peer_id),
            Err(DirectoryError::NotFound(_)) => {
                warn!("record for {} vanished, re-advertising", self.peer_id);
                if let Err(e) = self.directory.create_server(&self.peer_id).await {
                    warn!("could not re-advertise {}: {}", self.peer_id, e);
                }
                // hosting began while the directory was down
                if self.subscriptions.is_empty() {
                    let me = self.peer_id.clone();
                    self.subscribe_mailbox(&me);
                }
            }
            Err(e) => warn!("heartbeat for {} failed: {}", self.peer_id, e),
        }
        metrics::record(|m| m.discovery.heartbeats.inc());
        HeartbeatOutcome::Refreshed
    }

    /// Withdraw from the directory; deletes our record when hosting
    pub async fn shutdown(&mut self) {
        if self.role.is_host() {
            match self.directory.delete_server(&self.peer_id).await {
                Ok(()) => info!("withdrew host record {}", self.peer_id),
                Err(e) => warn!("could not withdraw {}: {}", self.peer_id, e),
            }
        }
        self.begin_epoch();
        self.role = Role::Undetermined;
    }
}

impl SignalRelay for SignalingManager {
    fn send_signal(&self, to: &PeerId, signal: PeerSignal) -> BoxFuture<'_, Result<()>> {
        self.post(to, signal)
    }
}
