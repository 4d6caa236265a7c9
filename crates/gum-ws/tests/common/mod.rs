//! Shared fixtures for transport integration tests.
//!
//! `MockBridge` is a bare WebSocket server that counts connections, records
//! every text frame it receives and can push frames or close frames to all
//! connected clients.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use gum_ws::{TransportObserver, WsError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
enum Push {
    Text(String),
    Close(u16),
}

pub struct MockBridge {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
    push_tx: broadcast::Sender<Push>,
}

impl MockBridge {
    /// Start on an ephemeral port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (push_tx, _) = broadcast::channel(64);

        let conns = connections.clone();
        let recv = received.clone();
        let push = push_tx.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                conns.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_connection(stream, recv.clone(), push.subscribe()));
            }
        });

        Self {
            addr,
            connections,
            received,
            push_tx,
        }
    }

    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Send `text` to every connected client.
    pub fn push(&self, text: &str) {
        let _ = self.push_tx.send(Push::Text(text.to_string()));
    }

    /// Close every connected client with `code`.
    pub fn close_all(&self, code: u16) {
        let _ = self.push_tx.send(Push::Close(code));
    }
}

async fn handle_connection(
    stream: TcpStream,
    received: Arc<Mutex<Vec<String>>>,
    mut push_rx: broadcast::Receiver<Push>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => received.lock().push(text),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            },
            push = push_rx.recv() => match push {
                Ok(Push::Text(text)) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Push::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "closed by test".into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break;
                }
                Err(_) => break,
            },
        }
    }
}

/// Observer that records what it is told.
#[derive(Default)]
pub struct RecordingObserver {
    pub errors: Mutex<Vec<String>>,
    pub unauthorized: AtomicUsize,
}

impl RecordingObserver {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn unauthorized_count(&self) -> usize {
        self.unauthorized.load(Ordering::SeqCst)
    }
}

impl TransportObserver for RecordingObserver {
    fn on_unauthorized(&self, _dashboard_id: &str) {
        self.unauthorized.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _dashboard_id: &str, error: &WsError) {
        self.errors.lock().push(error.to_string());
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
