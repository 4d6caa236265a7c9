//! Follower-side virtual socket.
//!
//! A follower never opens its own server connection: the bridge allows one
//! connection per tab id and would drop the leader's. Instead it posts its
//! outbound frames on the dashboard's bus for the leader to forward, and
//! turns the leader's relayed server frames back into message events.

use crate::bus::{BusMessage, BusPort, BusReceiver};
use crate::config::TransportConfig;
use crate::connection::{
    next_connection_id, Connection, ConnectionEvent, ConnectionId, ConnectionKind,
};
use crate::error::{WsError, WsResult};
use crate::heartbeat::LivenessMonitor;
use gum_telemetry::Metrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Connection that proxies through the leader tab over the bus.
pub struct ChannelProxyConnection {
    id: ConnectionId,
    port: BusPort,
    closed: AtomicBool,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelProxyConnection {
    /// Link to the leader on `port`. Reports `Opened` after a short tick.
    pub fn open(
        port: BusPort,
        config: &TransportConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let id = next_connection_id();
        let shutdown = CancellationToken::new();
        let liveness = LivenessMonitor::new(config.leader_timeout());
        let rx = port.subscribe();

        tokio::spawn(run_proxy(
            id,
            rx,
            liveness,
            config.connect_tick(),
            config.liveness_check_interval(),
            shutdown.clone(),
            events.clone(),
        ));

        debug!(conn_id = id, channel = %port.name(), "Follower linked to bus");

        Self {
            id,
            port,
            closed: AtomicBool::new(false),
            shutdown,
            events,
        }
    }
}

impl Connection for ChannelProxyConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::ChannelProxy
    }

    /// Post the frame for the leader to forward.
    ///
    /// After `close()` this logs and drops the frame. A failing post on an
    /// open proxy means the leader is unreachable and is reported as such.
    fn send(&self, text: String) -> WsResult<()> {
        if self.closed.load(Ordering::Acquire) {
            warn!(conn_id = self.id, "Send on closed follower, dropping frame");
            return Ok(());
        }
        if let Err(e) = self.port.post(BusMessage::ClientToServer { payload: text }) {
            warn!(conn_id = self.id, %e, "Bus post failed, leader unreachable");
            Metrics::leader_timeout();
            let _ = self.events.send(ConnectionEvent::Error {
                conn_id: self.id,
                error: WsError::LeaderDisconnected,
            });
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(conn_id = self.id, "Closing follower link");
            self.shutdown.cancel();
            self.port.close();
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

async fn run_proxy(
    id: ConnectionId,
    mut rx: BusReceiver,
    liveness: LivenessMonitor,
    connect_tick: Duration,
    check_interval: Duration,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    tokio::select! {
        () = shutdown.cancelled() => return,
        () = tokio::time::sleep(connect_tick) => {
            let _ = events.send(ConnectionEvent::Opened { conn_id: id });
        }
    }

    let mut checker = tokio::time::interval_at(
        tokio::time::Instant::now() + check_interval,
        check_interval,
    );
    checker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,

            message = rx.recv() => match message {
                Some(BusMessage::ServerToClient { data }) => {
                    let _ = events.send(ConnectionEvent::Message { conn_id: id, text: data });
                }
                Some(BusMessage::LeaderHeartbeat { .. }) => liveness.record_heartbeat(),
                // Another follower's request; only the leader acts on these.
                Some(BusMessage::ClientToServer { .. }) => {}
                None => return,
            },

            _ = checker.tick() => {
                if liveness.check() {
                    warn!(
                        conn_id = id,
                        silent_ms = liveness.since_last_heartbeat().as_millis() as u64,
                        "No leader heartbeat, leader disconnected"
                    );
                    Metrics::leader_timeout();
                    let _ = events.send(ConnectionEvent::Error {
                        conn_id: id,
                        error: WsError::LeaderDisconnected,
                    });
                }
            }
        }
    }
}
