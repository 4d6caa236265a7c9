//! Connections as seen by the transport.
//!
//! A leader talks to the bridge over a `RealConnection`; a follower talks to
//! its leader over a `ChannelProxyConnection` (see `proxy`). Both expose the
//! same `Connection` surface and report what happens to them as
//! `ConnectionEvent`s on the manager's event channel, so the rest of the
//! transport does not care which one it holds.

use crate::error::{WsError, WsResult};
use futures_util::{SinkExt, StreamExt};
use gum_telemetry::Metrics;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Real,
    ChannelProxy,
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// What a connection reports back to its owner.
#[derive(Debug)]
pub enum ConnectionEvent {
    Opened {
        conn_id: ConnectionId,
    },
    Message {
        conn_id: ConnectionId,
        text: String,
    },
    /// Non-fatal condition; the connection object stays usable.
    Error {
        conn_id: ConnectionId,
        error: WsError,
    },
    Closed {
        conn_id: ConnectionId,
        clean: bool,
        code: u16,
        reason: String,
    },
}

/// Capability set shared by real and proxied connections.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn kind(&self) -> ConnectionKind;

    /// Queue a text frame. Fire-and-forget.
    fn send(&self, text: String) -> WsResult<()>;

    /// Close the connection. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// A real WebSocket to the bridge.
pub struct RealConnection {
    id: ConnectionId,
    outbound_tx: mpsc::UnboundedSender<String>,
    state: Arc<RwLock<ConnectionState>>,
    shutdown: CancellationToken,
}

impl RealConnection {
    /// Start connecting to `url`; events arrive on `events`.
    ///
    /// Frames sent while still connecting are queued and flushed once the
    /// socket opens.
    pub fn open(url: Url, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        let id = next_connection_id();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let shutdown = CancellationToken::new();

        tokio::spawn(run_connection(
            id,
            url,
            outbound_rx,
            state.clone(),
            shutdown.clone(),
            events,
        ));

        Self {
            id,
            outbound_tx,
            state,
            shutdown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }
}

impl Connection for RealConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Real
    }

    fn send(&self, text: String) -> WsResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(WsError::NotConnected);
        }
        self.outbound_tx
            .send(text)
            .map_err(|_| WsError::NotConnected)
    }

    fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(conn_id = self.id, "Closing server connection");
            self.shutdown.cancel();
        }
    }

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}

async fn run_connection(
    id: ConnectionId,
    url: Url,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    state: Arc<RwLock<ConnectionState>>,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    info!(conn_id = id, url = %url, "Connecting to bridge");

    let connected = tokio::select! {
        () = shutdown.cancelled() => {
            *state.write() = ConnectionState::Closed;
            return;
        }
        result = connect_async(url.as_str()) => result,
    };

    let ws_stream = match connected {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            error!(conn_id = id, ?e, "Bridge connection failed");
            *state.write() = ConnectionState::Closed;
            let _ = events.send(ConnectionEvent::Error {
                conn_id: id,
                error: WsError::ConnectionFailed(e.to_string()),
            });
            let _ = events.send(ConnectionEvent::Closed {
                conn_id: id,
                clean: false,
                code: 1006,
                reason: "connect failed".to_string(),
            });
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    *state.write() = ConnectionState::Open;
    Metrics::server_connected();
    info!(conn_id = id, "Bridge connected");
    let _ = events.send(ConnectionEvent::Opened { conn_id: id });

    let closed = loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    warn!(conn_id = id, ?e, "Failed to send Close frame");
                }
                break None;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(ConnectionEvent::Message { conn_id: id, text });
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!(conn_id = id, ?e, "Failed to answer ping");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason): (u16, String) = frame
                            .map(|f| (f.code.into(), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        warn!(conn_id = id, code, %reason, "Bridge closed connection");
                        break Some((true, code, reason));
                    }
                    Some(Err(e)) => {
                        error!(conn_id = id, ?e, "Bridge read error");
                        break Some((false, 1006, e.to_string()));
                    }
                    None => {
                        warn!(conn_id = id, "Bridge stream ended");
                        break Some((false, 1006, "stream ended".to_string()));
                    }
                    _ => {}
                }
            }

            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else {
                    debug!(conn_id = id, "Connection handle dropped, closing");
                    let _ = write.send(Message::Close(None)).await;
                    break None;
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    error!(conn_id = id, ?e, "Bridge write error");
                    break Some((false, 1006, e.to_string()));
                }
            }
        }
    };

    *state.write() = ConnectionState::Closed;
    Metrics::server_disconnected();

    if let Some((clean, code, reason)) = closed {
        let _ = events.send(ConnectionEvent::Closed {
            conn_id: id,
            clean,
            code,
            reason,
        });
    }
}
