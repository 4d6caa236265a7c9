//! Leader heartbeat and follower liveness.
//!
//! The bus gives no disconnect notification, so a follower learns that its
//! leader tab went away only by the heartbeats stopping.

use crate::bus::{BusMessage, BusPort};
use gum_telemetry::Metrics;
use parking_lot::RwLock;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Post `LEADER_HEARTBEAT` on `port` every `interval` until `shutdown`
/// fires or a post fails.
pub fn spawn_leader_heartbeat(
    port: BusPort,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(channel = %port.name(), "Leader heartbeat stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let beat = BusMessage::LeaderHeartbeat {
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    if let Err(e) = port.post(beat) {
                        warn!(channel = %port.name(), %e, "Heartbeat post failed, stopping");
                        return;
                    }
                    Metrics::heartbeat_sent();
                    trace!(channel = %port.name(), "Leader heartbeat posted");
                }
            }
        }
    })
}

/// Follower-side view of leader liveness.
pub struct LivenessMonitor {
    timeout: Duration,
    last_heartbeat: RwLock<Instant>,
    /// Whether the current outage was already reported.
    reported: RwLock<bool>,
}

impl LivenessMonitor {
    /// Start monitoring; the clock starts now, as if a heartbeat was seen.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_heartbeat: RwLock::new(Instant::now()),
            reported: RwLock::new(false),
        }
    }

    /// Record a heartbeat and re-arm reporting.
    pub fn record_heartbeat(&self) {
        *self.last_heartbeat.write() = Instant::now();
        *self.reported.write() = false;
    }

    pub fn since_last_heartbeat(&self) -> Duration {
        self.last_heartbeat.read().elapsed()
    }

    pub fn is_timed_out(&self) -> bool {
        self.since_last_heartbeat() > self.timeout
    }

    /// Returns `true` exactly once per sustained outage.
    pub fn check(&self) -> bool {
        if !self.is_timed_out() {
            return false;
        }
        let mut reported = self.reported.write();
        if *reported {
            return false;
        }
        *reported = true;
        true
    }
}
