//! Connection contexts and their registry.
//!
//! One context per dashboard instance observed in this tab, keyed by the
//! dashboard (tab) id. The registry is owned by a `TransportManager`; there
//! is no process-wide state.

use crate::bus::BusPort;
use crate::connection::{Connection, ConnectionId};
use crate::lifecycle::UnloadHandlerId;
use crate::listener::Listener;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Transport role of a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the real server connection.
    Leader,
    /// Proxies through a leader over the bus.
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Follower => "follower",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) type ConnectedCallback = Box<dyn FnOnce() + Send>;

/// Per-dashboard connection state.
pub struct ConnectionContext {
    pub dashboard_id: String,
    pub role: Role,
    pub is_design: bool,
    /// Real or proxied connection; `None` after the server closed it.
    pub socket: Option<Arc<dyn Connection>>,
    /// Leader only: bus used to fan out to followers.
    pub channel: Option<BusPort>,
    pub listeners: Vec<Listener>,
    /// Leader only: stops the heartbeat and bus relay tasks.
    pub(crate) tasks: Option<CancellationToken>,
    pub(crate) unload_handler: Option<UnloadHandlerId>,
    pub(crate) on_connected: Option<ConnectedCallback>,
    torn_down: bool,
}

impl ConnectionContext {
    pub fn new(dashboard_id: impl Into<String>, is_design: bool, role: Role) -> Self {
        Self {
            dashboard_id: dashboard_id.into(),
            role,
            is_design,
            socket: None,
            channel: None,
            listeners: Vec::new(),
            tasks: None,
            unload_handler: None,
            on_connected: None,
            torn_down: false,
        }
    }

    pub fn socket_id(&self) -> Option<ConnectionId> {
        self.socket.as_ref().map(|s| s.id())
    }

    /// Release the socket, bus port and timers. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(tasks) = self.tasks.take() {
            tasks.cancel();
        }
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.on_connected = None;
        debug!(dashboard_id = %self.dashboard_id, role = %self.role, "Context torn down");
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Keyed collection of contexts with one "current" entry.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: HashMap<String, ConnectionContext>,
    current: Option<String>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `context` and make it current. Returns the entry it replaced.
    pub fn insert(&mut self, context: ConnectionContext) -> Option<ConnectionContext> {
        let id = context.dashboard_id.clone();
        self.current = Some(id.clone());
        self.contexts.insert(id, context)
    }

    pub fn get(&self, dashboard_id: &str) -> Option<&ConnectionContext> {
        self.contexts.get(dashboard_id)
    }

    pub fn get_mut(&mut self, dashboard_id: &str) -> Option<&mut ConnectionContext> {
        self.contexts.get_mut(dashboard_id)
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current(&self) -> Option<&ConnectionContext> {
        self.current.as_deref().and_then(|id| self.contexts.get(id))
    }

    pub fn current_mut(&mut self) -> Option<&mut ConnectionContext> {
        let id = self.current.clone()?;
        self.contexts.get_mut(&id)
    }

    /// Remove an entry, clearing "current" if it pointed at it.
    ///
    /// The caller tears the context down outside any lock it holds.
    pub fn remove(&mut self, dashboard_id: &str) -> Option<ConnectionContext> {
        let removed = self.contexts.remove(dashboard_id);
        if removed.is_some() && self.current.as_deref() == Some(dashboard_id) {
            self.current = None;
        }
        removed
    }

    /// Ids of every context bound to `conn_id`.
    pub fn ids_for_connection(&self, conn_id: ConnectionId) -> Vec<String> {
        self.contexts
            .values()
            .filter(|c| c.socket_id() == Some(conn_id))
            .map(|c| c.dashboard_id.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.contexts.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
