//! Development bridge server using axum.
//!
//! Accepts one WebSocket per tab id at `/<bridge_path>/{tab_id}`. A newer
//! connection for the same id displaces the older one, which is closed with
//! code 4000. This is the server behaviour that makes preview tabs share
//! their design tab's connection instead of opening their own.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use gum_telemetry::Metrics;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeServerConfig;
use crate::devices::{DeviceStore, Reply};
use crate::error::BridgeResult;

/// Close code sent to a connection displaced by a newer one.
pub const DISPLACED_CLOSE_CODE: u16 = 4000;

const BROADCAST_CAPACITY: usize = 256;

/// Caps concurrent WebSocket connections.
pub struct ConnectionLimiter {
    current: AtomicUsize,
    max: usize,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            max,
        }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        loop {
            let current = self.current.load(Ordering::Acquire);
            if current >= self.max {
                return None;
            }
            if self
                .current
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ConnectionGuard {
                    limiter: self.clone(),
                });
            }
        }
    }

    pub fn current_count(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }
}

/// Slot held for the lifetime of one connection.
pub struct ConnectionGuard {
    limiter: Arc<ConnectionLimiter>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.limiter.current.fetch_sub(1, Ordering::Release);
    }
}

/// The live connection for one tab id.
struct Session {
    id: u64,
    displaced: CancellationToken,
}

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct BridgeState {
    devices: Arc<DeviceStore>,
    sessions: Arc<DashMap<String, Session>>,
    next_session: Arc<AtomicU64>,
    broadcast_tx: broadcast::Sender<String>,
    limiter: Arc<ConnectionLimiter>,
}

impl BridgeState {
    pub fn new(config: &BridgeServerConfig) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            devices: Arc::new(DeviceStore::new(config.devices.clone())),
            sessions: Arc::new(DashMap::new()),
            next_session: Arc::new(AtomicU64::new(1)),
            broadcast_tx,
            limiter: Arc::new(ConnectionLimiter::new(config.max_connections)),
        }
    }

    /// Record `tab_id`'s new connection, displacing any previous one.
    fn register(&self, tab_id: &str) -> (u64, CancellationToken) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let displaced = CancellationToken::new();
        let previous = self.sessions.insert(
            tab_id.to_string(),
            Session {
                id,
                displaced: displaced.clone(),
            },
        );
        if let Some(previous) = previous {
            info!(%tab_id, previous = previous.id, "Displacing older connection");
            Metrics::bridge_displaced();
            previous.displaced.cancel();
        }
        (id, displaced)
    }

    fn unregister(&self, tab_id: &str, id: u64) {
        self.sessions.remove_if(tab_id, |_, s| s.id == id);
    }

    /// Number of tab ids with a live connection.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Create the axum router.
pub fn create_router(config: &BridgeServerConfig, state: BridgeState) -> Router {
    Router::new()
        .route(&config.route(), get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Prometheus text exposition.
async fn metrics_handler() -> Response {
    match Metrics::gather_text() {
        Ok(text) => text.into_response(),
        Err(e) => {
            warn!(%e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    State(state): State<BridgeState>,
    Path(tab_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(guard) = state.limiter.try_acquire() else {
        warn!(
            current = state.limiter.current_count(),
            "WebSocket connection limit reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    info!(%tab_id, connections = state.limiter.current_count(), "New bridge connection");
    ws.on_upgrade(move |socket| handle_socket(socket, tab_id, state, guard))
}

/// Serve one tab's connection until it closes or is displaced.
async fn handle_socket(
    socket: WebSocket,
    tab_id: String,
    state: BridgeState,
    _guard: ConnectionGuard,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut broadcast_rx = state.broadcast_tx.subscribe();
    let (session_id, displaced) = state.register(&tab_id);
    Metrics::bridge_connected();

    loop {
        tokio::select! {
            () = displaced.cancelled() => {
                let frame = CloseFrame {
                    code: DISPLACED_CLOSE_CODE,
                    reason: "displaced by a newer connection".into(),
                };
                let _ = sender.send(Message::Close(Some(frame))).await;
                break;
            }

            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => match state.devices.handle(text.as_str()) {
                    Some(Reply::Sender(reply)) => {
                        if sender.send(Message::Text(reply.into())).await.is_err() {
                            debug!(%tab_id, "Failed to reply, client disconnected");
                            break;
                        }
                    }
                    Some(Reply::Broadcast(event)) => {
                        let _ = state.broadcast_tx.send(event);
                    }
                    None => {}
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!(%tab_id, "Client closed");
                    break;
                }
                Some(Err(e)) => {
                    debug!(%tab_id, error = %e, "WebSocket receive error");
                    break;
                }
                _ => {}
            },

            result = broadcast_rx.recv() => match result {
                Ok(event) => {
                    if sender.send(Message::Text(event.into())).await.is_err() {
                        debug!(%tab_id, "Failed to send event, client disconnected");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(%tab_id, skipped = n, "Bridge client lagged, catching up");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    state.unregister(&tab_id, session_id);
    Metrics::bridge_disconnected();
    info!(%tab_id, "Bridge connection closed");
}

/// A bound, not yet running, bridge server.
pub struct BridgeServer {
    listener: TcpListener,
    router: Router,
    state: BridgeState,
}

impl BridgeServer {
    pub async fn bind(config: &BridgeServerConfig) -> BridgeResult<Self> {
        let listener = TcpListener::bind(config.socket_addr()?).await?;
        let state = BridgeState::new(config);
        let router = create_router(config, state.clone());
        Ok(Self {
            listener,
            router,
            state,
        })
    }

    pub fn local_addr(&self) -> BridgeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> BridgeState {
        self.state.clone()
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> BridgeResult<()> {
        info!(addr = %self.local_addr()?, "Bridge listening");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        Ok(())
    }
}
