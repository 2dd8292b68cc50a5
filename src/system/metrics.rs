//! Metrics collection for racenet
//!
//! Counters are process-wide: every session in the process reports into the
//! same global registry.

use crate::core::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Registry,
};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Role election and host lifecycle
pub struct DiscoveryMetrics {
    /// Elections that ended in hosting
    pub elected_host: IntCounter,
    /// Elections that ended in joining a host
    pub joined_host: IntCounter,
    /// Discovery calls that failed against the directory
    pub discovery_failures: IntCounter,
    /// ServerRecord refreshes
    pub heartbeats: IntCounter,
    /// Hosts that stepped down for a fresher rival
    pub host_yields: IntCounter,
    /// Failover loops entered
    pub failovers: IntCounter,
}

/// Mailbox traffic
pub struct SignalingMetrics {
    /// Envelopes written to a mailbox
    pub envelopes_sent: IntCounter,
    /// Envelopes handled and deleted
    pub envelopes_consumed: IntCounter,
    /// Envelopes dropped (duplicate, malformed or unmatched)
    pub envelopes_dropped: IntCounter,
}

/// Data channel traffic
pub struct NetworkMetrics {
    /// State frames written to channels
    pub frames_sent: IntCounter,
    /// State frames received
    pub frames_received: IntCounter,
    /// Frame entries refused by a host
    pub entries_rejected: IntCounter,
    /// Frames that failed to decode
    pub frames_malformed: IntCounter,
    /// Peer connections torn down
    pub peer_disconnects: IntCounter,
    /// Peers with an open data channel, summed over sessions
    pub connected_peers: IntGauge,
}

/// All racenet metrics
pub struct Metrics {
    /// Discovery and election
    pub discovery: DiscoveryMetrics,
    /// Signaling mailbox
    pub signaling: SignalingMetrics,
    /// Data channels
    pub network: NetworkMetrics,
}

impl Metrics {
    /// Create and register every metric
    pub fn new() -> Result<Self> {
        Ok(Self {
            discovery: DiscoveryMetrics::new()?,
            signaling: SignalingMetrics::new()?,
            network: NetworkMetrics::new()?,
        })
    }

    /// Get the global metrics instance, or `None` if registration failed
    pub fn global() -> Option<&'static Metrics> {
        static INSTANCE: Lazy<Option<Metrics>> = Lazy::new(|| match Metrics::new() {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::warn!("metrics disabled: {}", e);
                None
            }
        });
        INSTANCE.as_ref()
    }
}

impl DiscoveryMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            elected_host: register_int_counter_with_registry!(
                "rn_elected_host_total",
                "Elections that ended in hosting",
                REGISTRY
            )?,
            joined_host: register_int_counter_with_registry!(
                "rn_joined_host_total",
                "Elections that ended in joining a host",
                REGISTRY
            )?,
            discovery_failures: register_int_counter_with_registry!(
                "rn_discovery_failures_total",
                "Discovery calls that failed against the directory",
                REGISTRY
            )?,
            heartbeats: register_int_counter_with_registry!(
                "rn_heartbeats_total",
                "Host record refreshes",
                REGISTRY
            )?,
            host_yields: register_int_counter_with_registry!(
                "rn_host_yields_total",
                "Hosts that stepped down for a fresher rival",
                REGISTRY
            )?,
            failovers: register_int_counter_with_registry!(
                "rn_failovers_total",
                "Failover loops entered",
                REGISTRY
            )?,
        })
    }
}

impl SignalingMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            envelopes_sent: register_int_counter_with_registry!(
                "rn_envelopes_sent_total",
                "Signaling envelopes written to a mailbox",
                REGISTRY
            )?,
            envelopes_consumed: register_int_counter_with_registry!(
                "rn_envelopes_consumed_total",
                "Signaling envelopes handled and deleted",
                REGISTRY
            )?,
            envelopes_dropped: register_int_counter_with_registry!(
                "rn_envelopes_dropped_total",
                "Signaling envelopes dropped",
                REGISTRY
            )?,
        })
    }
}

impl NetworkMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            frames_sent: register_int_counter_with_registry!(
                "rn_frames_sent_total",
                "State frames written to data channels",
                REGISTRY
            )?,
            frames_received: register_int_counter_with_registry!(
                "rn_frames_received_total",
                "State frames received",
                REGISTRY
            )?,
            entries_rejected: register_int_counter_with_registry!(
                "rn_entries_rejected_total",
                "Frame entries refused for peers without an open channel",
                REGISTRY
            )?,
            frames_malformed: register_int_counter_with_registry!(
                "rn_frames_malformed_total",
                "Frames that failed to decode",
                REGISTRY
            )?,
            peer_disconnects: register_int_counter_with_registry!(
                "rn_peer_disconnects_total",
                "Peer connections torn down",
                REGISTRY
            )?,
            connected_peers: register_int_gauge_with_registry!(
                "rn_connected_peers",
                "Peers with an open data channel",
                REGISTRY
            )?,
        })
    }
}

/// Run `f` against the global metrics, if they registered
pub fn record(f: impl FnOnce(&Metrics)) {
    if let Some(metrics) = Metrics::global() {
        f(metrics);
    }
}

/// Force registration of the global metrics
pub fn init_registry() {
    let _ = Metrics::global();
}

/// Get the Prometheus registry
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Collect and return all metrics as a Prometheus-formatted string
pub fn collect_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = registry().gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
