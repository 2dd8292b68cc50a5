//! Single-task session dispatcher
//!
//! A [`Session`] owns one [`SignalingManager`] and one [`NetworkManager`] and
//! is the only code that mutates them. Directory and transport callbacks do
//! nothing but push a [`SessionEvent`] onto the session's queue; the
//! dispatcher drains that queue and runs the periodic tick, sweep and
//! heartbeat, one handler at a time.

use crate::core::{Clock, PeerId, Result, Role, SessionConfig};
use crate::directory::DirectoryService;
use crate::network::{ConnectionStatus, NetworkManager};
use crate::signaling::{DiscoveryOutcome, HeartbeatOutcome, SignalingEvent, SignalingManager};
use crate::transport::{LinkEvent, Transport};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Everything that can wake the dispatcher besides its timers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Directory notification or signaling timer
    Signaling(SignalingEvent),
    /// Transport notification
    Link(LinkEvent),
}

enum Wake {
    Tick,
    Sweep,
    Heartbeat,
    Event(SessionEvent),
    Stop,
}

/// One node of the game session
pub struct Session {
    config: SessionConfig,
    signaling: SignalingManager,
    network: NetworkManager,
    events: flume::Receiver<SessionEvent>,
}

impl Session {
    /// Create an undetermined node; call [`Session::start`] or [`Session::run`]
    pub fn new(
        config: SessionConfig,
        directory: Arc<dyn DirectoryService>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = flume::unbounded();

        let signal_tx = tx.clone();
        let signaling = SignalingManager::new(
            config.clone(),
            directory,
            clock.clone(),
            Arc::new(move |event| {
                let _ = signal_tx.send(SessionEvent::Signaling(event));
            }),
        );
        let network = NetworkManager::new(
            config.clone(),
            transport,
            clock,
            signaling.peer_id().clone(),
            Arc::new(move |event| {
                let _ = tx.send(SessionEvent::Link(event));
            }),
        );

        Ok(Self {
            config,
            signaling,
            network,
            events: rx,
        })
    }

    /// This node's current id
    pub fn peer_id(&self) -> &PeerId {
        self.signaling.peer_id()
    }

    /// This node's current role
    pub fn role(&self) -> &Role {
        self.signaling.role()
    }

    /// Gameplay surface
    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    /// Gameplay surface, for registering senders and listeners
    pub fn network_mut(&mut self) -> &mut NetworkManager {
        &mut self.network
    }

    /// Run discovery and act on its outcome
    pub async fn start(&mut self) {
        self.network
            .emit_status(ConnectionStatus::Connecting, "Searching for available servers...");
        let outcome = self.signaling.discover_or_become_host().await;
        self.apply_outcome(outcome).await;
    }

    async fn apply_outcome(&mut self, outcome: DiscoveryOutcome) {
        self.network
            .set_identity(self.signaling.peer_id().clone(), self.signaling.role().clone());
        match outcome {
            DiscoveryOutcome::BecameHost => {
                let id = self.signaling.peer_id().clone();
                self.network.emit_log(format!("Became server {}", id));
                self.network
                    .emit_status(ConnectionStatus::Connected, format!("Hosting as {}", id));
            }
            DiscoveryOutcome::Joined { host } => {
                self.network
                    .emit_log(format!("Found active server {}, joining as client", host));
                self.network
                    .emit_status(ConnectionStatus::Connecting, format!("Connecting to {}...", host));
                if let Err(e) = self.network.initiate_connection(&host, &self.signaling).await {
                    warn!("could not start negotiation with {}: {}", host, e);
                    self.network.handle_disconnect(&host);
                }
                // A crashed host leaves a fresh record but never answers
                self.signaling.schedule_host_grace(host);
            }
            DiscoveryOutcome::Skipped => {}
        }
    }

    /// Drain every queued event; returns how many were handled
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Handle one event to completion
    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Signaling(SignalingEvent::Mailbox { epoch, stored }) => {
                if let Some((from, signal)) = self.signaling.handle_signaling(epoch, stored).await {
                    if let Err(e) = self
                        .network
                        .handle_peer_signal(from.clone(), signal, &self.signaling)
                        .await
                    {
                        warn!("negotiation with {} failed: {}", from, e);
                    }
                }
            }
            SessionEvent::Signaling(SignalingEvent::HostRecord { epoch, change }) => {
                if self.signaling.host_record_changed(epoch, &change) {
                    self.network.emit_log("Host disconnected (record deleted)");
                    self.failover().await;
                }
            }
            SessionEvent::Signaling(SignalingEvent::Rediscover { epoch }) => {
                if self.signaling.should_rediscover(epoch) {
                    self.start().await;
                }
            }
            SessionEvent::Signaling(SignalingEvent::HostGrace { epoch, host }) => {
                if self.signaling.grace_applies(epoch, &host) && !self.network.has_open_channel(&host) {
                    info!("host {} still unreachable after grace period", host);
                    self.failover().await;
                }
            }
            SessionEvent::Link(event) => {
                if let Some(lost) = self.network.on_link_event(event, &self.signaling).await {
                    if self.signaling.role().host() == Some(&lost) {
                        self.network
                            .emit_status(ConnectionStatus::Connecting, format!("Lost link to {}", lost));
                        self.signaling.schedule_host_grace(lost);
                    }
                }
            }
        }
    }

    /// Give up on the current role and rediscover after the configured pause
    async fn failover(&mut self) {
        self.network.reset_connections();
        self.signaling.handle_disconnect();
        self.network
            .set_identity(self.signaling.peer_id().clone(), Role::Undetermined);
        self.network
            .emit_status(ConnectionStatus::Disconnected, "Disconnected from server");
    }

    /// Broadcast (host) or uplink (client)
    pub fn tick(&mut self) {
        self.network.tick();
    }

    /// Inactivity sweep
    pub fn sweep(&mut self) {
        self.network.check_inactive_peers();
    }

    /// Refresh the host record; steps down when outranked
    pub async fn heartbeat(&mut self) {
        let peers = self.network.get_connected_peers().len();
        if self.signaling.heartbeat(peers).await == HeartbeatOutcome::Yielded {
            self.network.emit_log("Yielding to a fresher server");
            self.failover().await;
        }
    }

    /// Discover, then dispatch events and timers until `shutdown` resolves.
    ///
    /// The session is left as it was; call [`Session::shutdown`] to withdraw.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await;

        let mut tick = interval(self.config.tick_interval);
        let mut sweep = interval(self.config.inactivity_check_interval);
        let mut heartbeat = interval(self.config.heartbeat_interval);
        for timer in [&mut tick, &mut sweep, &mut heartbeat] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }
        // first heartbeat is due one interval after the record was created
        heartbeat.tick().await;

        tokio::pin!(shutdown);
        loop {
            let wake = tokio::select! {
                _ = &mut shutdown => Wake::Stop,
                event = self.events.recv_async() => match event {
                    Ok(event) => Wake::Event(event),
                    Err(_) => Wake::Stop,
                },
                _ = tick.tick() => Wake::Tick,
                _ = sweep.tick() => Wake::Sweep,
                _ = heartbeat.tick() => Wake::Heartbeat,
            };
            match wake {
                Wake::Tick => self.tick(),
                Wake::Sweep => self.sweep(),
                Wake::Heartbeat => self.heartbeat().await,
                Wake::Event(event) => self.handle_event(event).await,
                Wake::Stop => break,
            }
        }
        Ok(())
    }

    /// Withdraw from the directory and close every connection
    pub async fn shutdown(&mut self) {
        debug!("shutting down {}", self.signaling.peer_id());
        self.signaling.shutdown().await;
        self.network.cleanup();
    }
}
