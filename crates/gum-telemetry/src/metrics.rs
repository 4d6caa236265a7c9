//! Prometheus metrics for the gum-boards transport.
//!
//! Covers:
//! - Server connections owned by leader tabs
//! - Leader/follower context counts
//! - Frames relayed over the inter-tab bus
//! - Heartbeats and leader timeouts
//! - Inbound parse failures and listener dispatches
//! - Development bridge connections
//!
//! # Panics
//!
//! Registration panics on first access if two metrics share a name.

use crate::error::TelemetryResult;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_int_counter, register_int_gauge, register_int_gauge_vec,
    CounterVec, Encoder, IntCounter, IntGauge, IntGaugeVec, TextEncoder,
};

/// Live server connections held by leader tabs in this process.
pub static GUM_SERVER_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "gum_server_connections",
        "Live server connections owned by leader tabs"
    )
    .unwrap()
});

/// Connection contexts by role.
/// Labels: role (leader/follower)
pub static GUM_CONTEXTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "gum_contexts",
        "Connection contexts currently registered, by role",
        &["role"]
    )
    .unwrap()
});

/// Frames relayed over the inter-tab bus.
/// Labels: direction (server_to_client/client_to_server)
pub static GUM_RELAYED_FRAMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gum_relayed_frames_total",
        "Frames relayed between leader and follower tabs",
        &["direction"]
    )
    .unwrap()
});

/// Leader heartbeats posted on the bus.
pub static GUM_HEARTBEATS_SENT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gum_heartbeats_sent_total",
        "Leader heartbeats posted on the inter-tab bus"
    )
    .unwrap()
});

/// Leader-disconnected conditions raised by followers.
pub static GUM_LEADER_TIMEOUTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gum_leader_timeouts_total",
        "Leader-disconnected conditions raised by follower tabs"
    )
    .unwrap()
});

/// Inbound frames dropped because they were not valid envelopes.
pub static GUM_PARSE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gum_parse_errors_total",
        "Inbound frames dropped as malformed"
    )
    .unwrap()
});

/// Listener callbacks invoked.
/// Labels: action (lower-cased action name)
pub static GUM_LISTENER_DISPATCH_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gum_listener_dispatch_total",
        "Listener callbacks invoked for inbound events",
        &["action"]
    )
    .unwrap()
});

/// Open sockets on the development bridge.
pub static GUM_BRIDGE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "gum_bridge_connections",
        "Open WebSocket connections on the development bridge"
    )
    .unwrap()
});

/// Bridge sockets closed because a newer socket claimed the same tab id.
pub static GUM_BRIDGE_DISPLACED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gum_bridge_displaced_total",
        "Bridge connections displaced by a newer connection for the same tab id"
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Record a leader's server socket opening.
    pub fn server_connected() {
        GUM_SERVER_CONNECTIONS.inc();
    }

    /// Record a leader's server socket going away.
    pub fn server_disconnected() {
        GUM_SERVER_CONNECTIONS.dec();
    }

    /// Record a context being registered under `role`.
    pub fn context_created(role: &str) {
        GUM_CONTEXTS.with_label_values(&[role]).inc();
    }

    /// Record a context being torn down.
    pub fn context_removed(role: &str) {
        GUM_CONTEXTS.with_label_values(&[role]).dec();
    }

    /// Record a frame relayed over the bus.
    pub fn frame_relayed(direction: &str) {
        GUM_RELAYED_FRAMES_TOTAL.with_label_values(&[direction]).inc();
    }

    /// Record a leader heartbeat.
    pub fn heartbeat_sent() {
        GUM_HEARTBEATS_SENT_TOTAL.inc();
    }

    /// Record a follower losing its leader.
    pub fn leader_timeout() {
        GUM_LEADER_TIMEOUTS_TOTAL.inc();
    }

    /// Record a dropped malformed frame.
    pub fn parse_error() {
        GUM_PARSE_ERRORS_TOTAL.inc();
    }

    /// Record a listener callback invocation.
    pub fn listener_dispatched(action: &str) {
        GUM_LISTENER_DISPATCH_TOTAL.with_label_values(&[action]).inc();
    }

    /// Record a bridge socket opening.
    pub fn bridge_connected() {
        GUM_BRIDGE_CONNECTIONS.inc();
    }

    /// Record a bridge socket closing.
    pub fn bridge_disconnected() {
        GUM_BRIDGE_CONNECTIONS.dec();
    }

    /// Record a bridge socket displaced by a newer one.
    pub fn bridge_displaced() {
        GUM_BRIDGE_DISPLACED_TOTAL.inc();
    }

    /// Render every registered metric in Prometheus text format.
    pub fn gather_text() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_appear_in_text_output() {
        Metrics::heartbeat_sent();
        Metrics::frame_relayed("server_to_client");

        let text = Metrics::gather_text().unwrap();
        assert!(text.contains("gum_heartbeats_sent_total"));
        assert!(text.contains("gum_relayed_frames_total"));
    }

    #[test]
    fn test_context_gauge_tracks_role() {
        Metrics::context_created("follower");
        let before = GUM_CONTEXTS.with_label_values(&["follower"]).get();
        Metrics::context_removed("follower");
        assert_eq!(GUM_CONTEXTS.with_label_values(&["follower"]).get(), before - 1);
    }
}
