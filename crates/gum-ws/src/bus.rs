//! Inter-tab broadcast bus.
//!
//! Models a same-origin `BroadcastChannel`: every port opened under the same
//! name hears what the other ports post, a port never hears itself, and
//! nothing tells a port when its peers go away. Messages from one sender
//! arrive in order; there is no ordering across senders.

use crate::error::{WsError, WsResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

const BUS_CAPACITY: usize = 256;

/// Message exchanged between leader and follower tabs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    /// Raw server frame relayed by the leader.
    #[serde(rename = "SERVER_TO_CLIENT")]
    ServerToClient { data: String },
    /// Raw outbound frame a follower wants the leader to send.
    #[serde(rename = "CLIENT_TO_SERVER")]
    ClientToServer { payload: String },
    /// Leader liveness signal.
    #[serde(rename = "LEADER_HEARTBEAT")]
    LeaderHeartbeat { timestamp: i64 },
}

#[derive(Debug, Clone)]
struct Posted {
    sender: u64,
    message: BusMessage,
}

/// A named channel and how many ports are open on it.
struct Channel {
    tx: broadcast::Sender<Posted>,
    open_ports: usize,
}

type Channels = Arc<DashMap<String, Channel>>;

/// The set of named channels visible to every tab of one browser.
///
/// A channel exists while at least one port on it is open.
#[derive(Clone, Default)]
pub struct BusHub {
    channels: Channels,
    next_port: Arc<AtomicU64>,
}

impl BusHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a port on the named channel.
    pub fn open(&self, name: &str) -> BusPort {
        let tx = {
            let mut channel = self
                .channels
                .entry(name.to_string())
                .or_insert_with(|| Channel {
                    tx: broadcast::channel(BUS_CAPACITY).0,
                    open_ports: 0,
                });
            channel.open_ports += 1;
            channel.tx.clone()
        };

        BusPort {
            name: name.to_string(),
            port_id: self.next_port.fetch_add(1, Ordering::Relaxed),
            tx,
            hub: Arc::downgrade(&self.channels),
            closed: Arc::new(AtomicBool::new(false)),
            close_token: CancellationToken::new(),
        }
    }

    /// Number of live receivers on a channel.
    pub fn receiver_count(&self, name: &str) -> usize {
        self.channels
            .get(name)
            .map_or(0, |ch| ch.tx.receiver_count())
    }

    /// Number of channels with an open port.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// One tab's handle on a named channel.
///
/// Clones share the same port identity and closed state.
#[derive(Clone)]
pub struct BusPort {
    name: String,
    port_id: u64,
    tx: broadcast::Sender<Posted>,
    hub: Weak<DashMap<String, Channel>>,
    closed: Arc<AtomicBool>,
    close_token: CancellationToken,
}

impl BusPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post to every other port on the channel.
    ///
    /// Fails with `BusClosed` once this port was closed. Posting with nobody
    /// listening is not an error.
    pub fn post(&self, message: BusMessage) -> WsResult<()> {
        if self.is_closed() {
            return Err(WsError::BusClosed);
        }
        if self
            .tx
            .send(Posted {
                sender: self.port_id,
                message,
            })
            .is_err()
        {
            trace!(channel = %self.name, "Bus post with no receivers");
        }
        Ok(())
    }

    /// Start receiving. Only messages posted after this call are seen.
    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            name: self.name.clone(),
            port_id: self.port_id,
            rx: self.tx.subscribe(),
            closed: self.close_token.clone(),
        }
    }

    /// Close the port. Idempotent. The last port to close drops the channel.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_token.cancel();

        let Some(channels) = self.hub.upgrade() else {
            return;
        };
        if let Some(mut channel) = channels.get_mut(&self.name) {
            channel.open_ports = channel.open_ports.saturating_sub(1);
        }
        if channels
            .remove_if(&self.name, |_, ch| ch.open_ports == 0)
            .is_some()
        {
            trace!(channel = %self.name, "Last port closed, channel dropped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Receiving side of a port.
pub struct BusReceiver {
    name: String,
    port_id: u64,
    rx: broadcast::Receiver<Posted>,
    closed: CancellationToken,
}

impl BusReceiver {
    /// Next message from another port, or `None` once the port is closed.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            tokio::select! {
                biased;
                () = self.closed.cancelled() => return None,
                result = self.rx.recv() => match result {
                    Ok(posted) if posted.sender == self.port_id => continue,
                    Ok(posted) => return Some(posted.message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %self.name, skipped, "Bus receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}
