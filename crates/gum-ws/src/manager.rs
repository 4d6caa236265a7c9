//! Per-tab transport manager.
//!
//! `TransportManager` is what a dashboard talks to. It decides the tab's
//! role, owns the context registry, drains connection events and routes
//! inbound frames to the `on_list` callback, the observer and listeners.
//!
//! Leader tabs hold the only server socket for a tab id and relay over the
//! bus. Follower tabs never touch the server; their requests are posted to
//! the leader, which forwards them verbatim.

use crate::bus::{BusHub, BusMessage, BusReceiver};
use crate::codec::{
    decode_inbound, encode_change_request, encode_execute_request, encode_list_request,
    encode_read_request, InboundFrame,
};
use crate::config::TransportConfig;
use crate::connection::{ConnectionEvent, ConnectionId, RealConnection};
use crate::context::{ConnectionContext, ContextRegistry, Role};
use crate::error::{WsError, WsResult};
use crate::heartbeat::spawn_leader_heartbeat;
use crate::lifecycle::PageLifecycle;
use crate::listener::{dispatch, Listener, ListenerCallback};
use crate::observer::{LoggingObserver, TransportObserver};
use crate::proxy::ChannelProxyConnection;
use crate::tab_id::{clear_tab_id, resolve_role, MemorySessionStore, RoleDecision, SessionStore};
use gum_core::{Action, ActuatorValue, Endpoint, IntoEndpoint};
use gum_telemetry::Metrics;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Action pattern matching every action.
pub const ANY_ACTION: &str = "*";

/// Callback for `Listed` payloads.
pub type ListCallback = Arc<dyn Fn(&Endpoint, &Value) + Send + Sync>;

/// Everything a tab provides from its surroundings.
#[derive(Clone)]
pub struct TabEnvironment {
    pub is_design: bool,
    /// The tab's query string, e.g. `?parentTabId=...`.
    pub query: String,
    pub session: Arc<dyn SessionStore>,
    pub bus: BusHub,
    pub lifecycle: PageLifecycle,
    pub observer: Arc<dyn TransportObserver>,
}

impl TabEnvironment {
    /// A design (editor) tab on `bus`.
    pub fn design(bus: BusHub) -> Self {
        Self::new(true, "", bus)
    }

    /// A preview tab on `bus` with the given query string.
    pub fn preview(bus: BusHub, query: impl Into<String>) -> Self {
        Self::new(false, query, bus)
    }

    fn new(is_design: bool, query: impl Into<String>, bus: BusHub) -> Self {
        Self {
            is_design,
            query: query.into(),
            session: Arc::new(MemorySessionStore::new()),
            bus,
            lifecycle: PageLifecycle::new(),
            observer: Arc::new(LoggingObserver),
        }
    }

    pub fn with_session(mut self, session: Arc<dyn SessionStore>) -> Self {
        self.session = session;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransportObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: PageLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

/// One or more device names for `add_listener`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNames(Vec<String>);

impl From<&str> for DeviceNames {
    fn from(name: &str) -> Self {
        Self(vec![name.to_string()])
    }
}

impl From<String> for DeviceNames {
    fn from(name: String) -> Self {
        Self(vec![name])
    }
}

impl From<Vec<String>> for DeviceNames {
    fn from(names: Vec<String>) -> Self {
        Self(names)
    }
}

impl From<&[&str]> for DeviceNames {
    fn from(names: &[&str]) -> Self {
        Self(names.iter().map(|n| n.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for DeviceNames {
    fn from(names: [&str; N]) -> Self {
        Self(names.iter().map(|n| n.to_string()).collect())
    }
}

/// Transport handle for one tab. Cheap to clone.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: TransportConfig,
    env: TabEnvironment,
    registry: Mutex<ContextRegistry>,
    on_list: RwLock<Option<ListCallback>>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    shutdown: CancellationToken,
}

impl TransportManager {
    pub fn new(config: TransportConfig, env: TabEnvironment) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ManagerInner {
                config,
                env,
                registry: Mutex::new(ContextRegistry::new()),
                on_list: RwLock::new(None),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Resolve the tab's role and open its connection.
    ///
    /// `on_connected` runs once the socket (leader) or bus link (follower)
    /// is open. An existing context for the same id is torn down first.
    /// Fails with `InvalidConfig` before any state changes when the timing
    /// values cannot drive the heartbeat. Must be called inside a tokio
    /// runtime.
    pub fn connect(
        &self,
        on_connected: impl FnOnce() + Send + 'static,
    ) -> WsResult<RoleDecision> {
        let inner = &self.inner;
        inner.config.validate()?;
        let env = &inner.env;
        let decision = resolve_role(&env.query, env.session.as_ref(), env.is_design);
        let tab_id = decision.tab_id.clone();

        // A bad base URL fails here, before any state changes.
        let url = match decision.role {
            Role::Leader => Some(
                inner
                    .config
                    .server_url(&tab_id, chrono::Utc::now().timestamp_millis())?,
            ),
            Role::Follower => None,
        };

        self.ensure_event_loop();
        if inner.remove_context(&tab_id) {
            debug!(%tab_id, "Replaced existing context");
        }

        let mut ctx = ConnectionContext::new(tab_id.clone(), env.is_design, decision.role);
        ctx.on_connected = Some(Box::new(on_connected));
        let port = env.bus.open(&inner.config.channel_name(&tab_id));

        // Held until insert: the first event must find the context.
        let mut registry = inner.registry.lock();

        match url {
            Some(url) => {
                info!(%tab_id, %url, "Connecting as leader");
                let socket = RealConnection::open(url, inner.events_tx.clone());
                let tasks = CancellationToken::new();
                spawn_leader_heartbeat(
                    port.clone(),
                    inner.config.heartbeat_interval(),
                    tasks.child_token(),
                );
                spawn_bus_relay(
                    Arc::downgrade(inner),
                    tab_id.clone(),
                    port.subscribe(),
                    tasks.child_token(),
                );
                ctx.socket = Some(Arc::new(socket));
                ctx.channel = Some(port);
                ctx.tasks = Some(tasks);
            }
            None => {
                info!(%tab_id, parent = ?decision.parent_id, "Connecting as follower");
                let proxy = ChannelProxyConnection::open(port, &inner.config, inner.events_tx.clone());
                ctx.socket = Some(Arc::new(proxy));
            }
        }

        let weak = Arc::downgrade(inner);
        let unload_id = tab_id.clone();
        ctx.unload_handler = Some(env.lifecycle.on_unload(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_context(&unload_id);
            }
        }));

        Metrics::context_created(decision.role.as_str());
        registry.insert(ctx);
        drop(registry);

        Ok(decision)
    }

    /// Tear down the current context. A no-op when there is none.
    pub fn close(&self) {
        let current = self.inner.registry.lock().current_id().map(str::to_string);
        if let Some(id) = current {
            self.inner.remove_context(&id);
        }
    }

    pub fn set_on_list(&self, callback: impl Fn(&Endpoint, &Value) + Send + Sync + 'static) {
        *self.inner.on_list.write() = Some(Arc::new(callback));
    }

    /// Ask the ExEn for its device list.
    pub fn request_list(&self, endpoint: impl IntoEndpoint) -> WsResult<()> {
        let endpoint = endpoint.into_endpoint()?;
        let text = encode_list_request(&endpoint)?;
        self.inner.send_current(text)
    }

    /// Ask for the current value of one device.
    pub fn request_value(&self, endpoint: impl IntoEndpoint, device_name: &str) -> WsResult<()> {
        let endpoint = endpoint.into_endpoint()?;
        let text = encode_read_request(&endpoint, device_name)?;
        self.inner.send_current(text)
    }

    /// Drive an actuator. The value is coerced to `declared_type`, or to its
    /// inferred type when none is given, before anything is sent.
    pub fn request_change(
        &self,
        endpoint: impl IntoEndpoint,
        actuator_name: &str,
        value: impl Into<ActuatorValue>,
        declared_type: Option<&str>,
    ) -> WsResult<()> {
        let endpoint = endpoint.into_endpoint()?;
        let text = encode_change_request(&endpoint, actuator_name, &value.into(), declared_type)?;
        self.inner.send_current(text)
    }

    pub fn execute_rule_or_script(&self, endpoint: impl IntoEndpoint, name: &str) -> WsResult<()> {
        let endpoint = endpoint.into_endpoint()?;
        let text = encode_execute_request(&endpoint, name)?;
        self.inner.send_current(text)
    }

    /// Subscribe `callback` to frames from `endpoint` for `device_names`
    /// and `action` (lower-case, `*` or `prefix*`; see [`ANY_ACTION`]).
    ///
    /// The listener is attached to the current context. Returns the id that
    /// `del_listener` takes.
    pub fn add_listener(
        &self,
        endpoint: impl IntoEndpoint,
        device_names: impl Into<DeviceNames>,
        callback: impl Fn(&str, &Value) + Send + Sync + 'static,
        action: &str,
    ) -> WsResult<Uuid> {
        let endpoint = endpoint.into_endpoint()?;
        let DeviceNames(names) = device_names.into();
        let id = Uuid::new_v4();
        let callback: ListenerCallback = Arc::new(callback);
        let action = action.to_lowercase();

        let mut registry = self.inner.registry.lock();
        let ctx = registry.current_mut().ok_or(WsError::NoActiveContext)?;
        for device_name in names {
            ctx.listeners.push(Listener {
                id,
                callback: callback.clone(),
                endpoint: endpoint.clone(),
                device_name,
                action: action.clone(),
            });
        }
        debug!(dashboard_id = %ctx.dashboard_id, listener_id = %id, %action, "Listener added");
        Ok(id)
    }

    /// Remove every entry registered under `id`, in every context.
    /// Returns how many entries were removed.
    pub fn del_listener(&self, id: Uuid) -> usize {
        let mut registry = self.inner.registry.lock();
        let mut removed = 0;
        for dashboard_id in registry.ids() {
            if let Some(ctx) = registry.get_mut(&dashboard_id) {
                let before = ctx.listeners.len();
                ctx.listeners.retain(|l| l.id != id);
                removed += before - ctx.listeners.len();
            }
        }
        debug!(listener_id = %id, removed, "Listener removed");
        removed
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.registry.lock().current().map(|c| c.role)
    }

    pub fn dashboard_id(&self) -> Option<String> {
        self.inner.registry.lock().current_id().map(str::to_string)
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .registry
            .lock()
            .current()
            .and_then(|c| c.socket.as_ref())
            .is_some_and(|s| s.is_open())
    }

    /// Listener entries on the current context.
    pub fn listener_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .current()
            .map_or(0, |c| c.listeners.len())
    }

    pub fn context_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Start the event task on first use. Later calls are no-ops.
    fn ensure_event_loop(&self) {
        let Some(mut rx) = self.inner.events_rx.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_event(event);
            }
            debug!("Transport event loop stopped");
        });
    }
}

/// Leader side of the bus: forward follower frames to the server.
fn spawn_bus_relay(
    inner: Weak<ManagerInner>,
    dashboard_id: String,
    mut rx: BusReceiver,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                () = shutdown.cancelled() => return,
                message = rx.recv() => message,
            };
            match message {
                Some(BusMessage::ClientToServer { payload }) => {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    inner.forward_to_server(&dashboard_id, payload);
                }
                // Another leader on the same id; nothing to do.
                Some(_) => {}
                None => return,
            }
        }
    });
}

impl ManagerInner {
    /// Remove and tear down one context. Returns whether it existed.
    fn remove_context(&self, dashboard_id: &str) -> bool {
        let removed = self.registry.lock().remove(dashboard_id);
        let Some(mut ctx) = removed else {
            return false;
        };
        if let Some(handler) = ctx.unload_handler.take() {
            self.env.lifecycle.detach(handler);
        }
        ctx.teardown();
        Metrics::context_removed(ctx.role.as_str());
        info!(%dashboard_id, role = %ctx.role, "Context removed");
        true
    }

    fn send_current(&self, text: String) -> WsResult<()> {
        let socket = {
            let registry = self.registry.lock();
            let ctx = registry.current().ok_or(WsError::NoActiveContext)?;
            ctx.socket.clone().ok_or(WsError::NotConnected)?
        };
        trace!(conn_id = socket.id(), "Sending frame");
        socket.send(text)
    }

    fn forward_to_server(&self, dashboard_id: &str, payload: String) {
        let socket = self
            .registry
            .lock()
            .get(dashboard_id)
            .and_then(|c| c.socket.clone());
        match socket {
            Some(socket) => match socket.send(payload) {
                Ok(()) => Metrics::frame_relayed("client_to_server"),
                Err(e) => warn!(%dashboard_id, %e, "Follower frame not forwarded"),
            },
            None => warn!(%dashboard_id, "Follower frame dropped, no server connection"),
        }
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { conn_id } => self.handle_opened(conn_id),
            ConnectionEvent::Message { conn_id, text } => self.handle_message(conn_id, &text),
            ConnectionEvent::Error { conn_id, error } => {
                let ids = self.registry.lock().ids_for_connection(conn_id);
                for id in ids {
                    self.env.observer.on_error(&id, &error);
                }
            }
            ConnectionEvent::Closed {
                conn_id,
                clean,
                code,
                reason,
            } => self.handle_closed(conn_id, clean, code, reason),
        }
    }

    fn handle_opened(&self, conn_id: ConnectionId) {
        let callbacks: Vec<_> = {
            let mut registry = self.registry.lock();
            registry
                .ids_for_connection(conn_id)
                .into_iter()
                .filter_map(|id| {
                    let ctx = registry.get_mut(&id)?;
                    info!(dashboard_id = %id, role = %ctx.role, "Connected");
                    ctx.on_connected.take()
                })
                .collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    fn handle_message(&self, conn_id: ConnectionId, text: &str) {
        let targets: Vec<_> = {
            let registry = self.registry.lock();
            registry
                .ids_for_connection(conn_id)
                .into_iter()
                .filter_map(|id| {
                    let ctx = registry.get(&id)?;
                    Some((id, ctx.channel.clone(), ctx.listeners.clone()))
                })
                .collect()
        };
        if targets.is_empty() {
            debug!(conn_id, "Frame from unbound connection ignored");
            return;
        }

        match decode_inbound(text) {
            Ok(frame) => {
                for (id, _, listeners) in &targets {
                    self.route_frame(id, listeners, &frame);
                }
            }
            Err(e) => {
                warn!(conn_id, %e, "Dropping malformed frame");
                Metrics::parse_error();
                let error = WsError::Codec(e);
                for (id, _, _) in &targets {
                    self.env.observer.on_error(id, &error);
                }
            }
        }

        for (id, channel, _) in &targets {
            let Some(channel) = channel else { continue };
            let relay = BusMessage::ServerToClient {
                data: text.to_string(),
            };
            match channel.post(relay) {
                Ok(()) => Metrics::frame_relayed("server_to_client"),
                Err(e) => debug!(dashboard_id = %id, %e, "Relay to followers skipped"),
            }
        }
    }

    fn route_frame(&self, dashboard_id: &str, listeners: &[Listener], frame: &InboundFrame) {
        match frame.action {
            Action::Listed => {
                let callback = self.on_list.read().clone();
                if let Some(callback) = callback {
                    callback(&frame.endpoint, &frame.payload);
                }
            }
            Action::Error => {
                let message = match &frame.payload {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                self.env
                    .observer
                    .on_error(dashboard_id, &WsError::Server(message));
            }
            _ => {}
        }

        let invoked = dispatch(listeners, frame);
        trace!(%dashboard_id, action = %frame.raw_action, invoked, "Frame dispatched");
    }

    fn handle_closed(&self, conn_id: ConnectionId, clean: bool, code: u16, reason: String) {
        let ids = self.registry.lock().ids_for_connection(conn_id);
        for id in ids {
            let error = WsError::ConnectionClosed {
                code,
                reason: reason.clone(),
                clean,
            };
            self.env.observer.on_error(&id, &error);

            if clean {
                // The bridge ends expired sessions with a clean close. The
                // bus and heartbeat stay up so followers keep their link.
                if let Some(ctx) = self.registry.lock().get_mut(&id) {
                    ctx.socket = None;
                }
                warn!(dashboard_id = %id, code, %reason, "Server closed the connection");
                self.env.observer.on_unauthorized(&id);
            } else {
                warn!(dashboard_id = %id, code, %reason, "Connection lost");
                let is_design = self
                    .registry
                    .lock()
                    .get(&id)
                    .map_or(self.env.is_design, |c| c.is_design);
                clear_tab_id(is_design, self.env.session.as_ref());
                self.remove_context(&id);
            }
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let registry = self.registry.get_mut();
        if registry.is_empty() {
            return;
        }
        for id in registry.ids() {
            if let Some(mut ctx) = registry.remove(&id) {
                if let Some(handler) = ctx.unload_handler.take() {
                    self.env.lifecycle.detach(handler);
                }
                ctx.teardown();
                Metrics::context_removed(ctx.role.as_str());
            }
        }
    }
}

#[cfg(test)]
impl TransportManager {
    /// Register a hand-built context as current.
    fn install_context(&self, ctx: ConnectionContext) {
        self.inner.registry.lock().insert(ctx);
    }

    fn inject(&self, event: ConnectionEvent) {
        self.inner.handle_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionKind};
    use crate::observer::MockTransportObserver;
    use crate::tab_id::{DESIGN_TAB_KEY, PREVIEW_TAB_KEY};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Connection that records what it was asked to send.
    struct RecordingConnection {
        id: ConnectionId,
        sent: Arc<Mutex<Vec<String>>>,
        closed: AtomicBool,
    }

    impl RecordingConnection {
        fn new(id: ConnectionId) -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let conn = Arc::new(Self {
                id,
                sent: sent.clone(),
                closed: AtomicBool::new(false),
            });
            (conn, sent)
        }
    }

    impl Connection for RecordingConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }
        fn kind(&self) -> ConnectionKind {
            ConnectionKind::Real
        }
        fn send(&self, text: String) -> WsResult<()> {
            self.sent.lock().push(text);
            Ok(())
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("exen", 8080, false)
    }

    fn quiet_observer() -> Arc<MockTransportObserver> {
        let mut observer = MockTransportObserver::new();
        observer.expect_on_error().return_const(());
        observer.expect_on_unauthorized().return_const(());
        Arc::new(observer)
    }

    fn design_manager(observer: Arc<dyn TransportObserver>) -> TransportManager {
        let env = TabEnvironment::design(BusHub::new()).with_observer(observer);
        TransportManager::new(TransportConfig::default(), env)
    }

    /// Leader context bound to a recording socket, with a follower-side bus
    /// receiver to observe relays.
    fn leader_with_socket(
        manager: &TransportManager,
        conn_id: ConnectionId,
    ) -> (Arc<Mutex<Vec<String>>>, BusReceiver) {
        let (socket, sent) = RecordingConnection::new(conn_id);
        let bus = &manager.inner.env.bus;
        let channel = bus.open("test_channel");
        let follower = bus.open("test_channel");
        let mut ctx = ConnectionContext::new("tab_leader", true, Role::Leader);
        ctx.socket = Some(socket);
        ctx.channel = Some(channel);
        manager.install_context(ctx);
        (sent, follower.subscribe())
    }

    #[test]
    fn test_requests_without_context_fail() {
        let manager = design_manager(quiet_observer());
        assert!(matches!(
            manager.request_list(&endpoint()),
            Err(WsError::NoActiveContext)
        ));
        assert!(matches!(
            manager.add_listener(&endpoint(), "light", |_, _| {}, ANY_ACTION),
            Err(WsError::NoActiveContext)
        ));
        manager.close();
        manager.close();
    }

    #[test]
    fn test_unknown_value_type_fails_before_sending() {
        let manager = design_manager(quiet_observer());
        let (sent, _rx) = leader_with_socket(&manager, 1);

        let result = manager.request_change(&endpoint(), "light", 1.0, Some("colour"));
        assert!(matches!(
            result,
            Err(WsError::Codec(gum_core::GumError::UnknownValueType(_)))
        ));
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn test_malformed_endpoint_fails_that_call_only() {
        let manager = design_manager(quiet_observer());
        let (sent, _rx) = leader_with_socket(&manager, 2);

        assert!(matches!(
            manager.request_list("{host: nope"),
            Err(WsError::Codec(gum_core::GumError::InvalidEndpoint(_)))
        ));
        manager
            .request_value(r#"{\"host\":\"exen\",\"port\":8080,\"ssl\":false}"#, "light")
            .unwrap();
        assert_eq!(sent.lock().len(), 1);
    }

    #[test]
    fn test_request_change_coerces_value() {
        let manager = design_manager(quiet_observer());
        let (sent, _rx) = leader_with_socket(&manager, 3);

        manager
            .request_change(&endpoint(), "light_A1", "true", None)
            .unwrap();
        manager
            .request_change(&endpoint(), "dimmer", "42.5abc", Some("number"))
            .unwrap();

        let sent = sent.lock();
        let first: Value = serde_json::from_str(&sent[0]).unwrap();
        let second: Value = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(first["msg"]["Change"], json!({"name": "light_A1", "value": true}));
        assert_eq!(second["msg"]["Change"]["value"], json!(42.5));
    }

    #[tokio::test]
    async fn test_leader_dispatches_then_relays_server_frames() {
        let manager = design_manager(quiet_observer());
        let (_sent, mut follower_rx) = leader_with_socket(&manager, 4);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        manager
            .add_listener(&endpoint(), "light_*", move |action, payload| {
                s.lock().push((action.to_string(), payload["value"].clone()));
            }, ANY_ACTION)
            .unwrap();

        let raw = r#"{"exen":{"host":"exen","port":8080,"ssl":false},"Changed":{"name":"light_A1","value":1}}"#;
        manager.inject(ConnectionEvent::Message {
            conn_id: 4,
            text: raw.to_string(),
        });

        assert_eq!(*seen.lock(), vec![("changed".to_string(), json!(1))]);
        match follower_rx.recv().await {
            Some(BusMessage::ServerToClient { data }) => assert_eq!(data, raw),
            other => panic!("unexpected bus message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_reported_and_still_relayed() {
        let mut observer = MockTransportObserver::new();
        observer
            .expect_on_error()
            .withf(|id, e| id == "tab_leader" && matches!(e, WsError::Codec(_)))
            .times(1)
            .return_const(());
        let manager = design_manager(Arc::new(observer));
        let (_sent, mut follower_rx) = leader_with_socket(&manager, 5);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        manager
            .add_listener(&endpoint(), "*", move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            }, ANY_ACTION)
            .unwrap();

        manager.inject(ConnectionEvent::Message {
            conn_id: 5,
            text: "not json".to_string(),
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            follower_rx.recv().await,
            Some(BusMessage::ServerToClient { .. })
        ));
    }

    #[test]
    fn test_listed_goes_to_on_list_and_error_to_observer() {
        let mut observer = MockTransportObserver::new();
        observer
            .expect_on_error()
            .withf(|id, e| id == "tab_leader" && matches!(e, WsError::Server(m) if m == "no such device"))
            .times(1)
            .return_const(());
        let manager = design_manager(Arc::new(observer));
        let _ = leader_with_socket(&manager, 6);

        let listed = Arc::new(Mutex::new(None));
        let l = listed.clone();
        manager.set_on_list(move |ep, payload| {
            *l.lock() = Some((ep.host().map(str::to_string), payload.clone()));
        });

        manager.inject(ConnectionEvent::Message {
            conn_id: 6,
            text: r#"{"exen":{"host":"exen","port":8080},"Listed":[{"name":"light_A1","value":0}]}"#
                .to_string(),
        });
        manager.inject(ConnectionEvent::Message {
            conn_id: 6,
            text: r#"{"exen":{"host":"exen","port":8080},"Error":"no such device"}"#.to_string(),
        });

        let listed = listed.lock().clone().unwrap();
        assert_eq!(listed.0.as_deref(), Some("exen"));
        assert_eq!(listed.1, json!([{"name": "light_A1", "value": 0}]));
    }

    #[test]
    fn test_del_listener_removes_every_entry() {
        let manager = design_manager(quiet_observer());
        let _ = leader_with_socket(&manager, 7);

        let id = manager
            .add_listener(&endpoint(), ["light_A1", "light_B2"], |_, _| {}, "changed")
            .unwrap();
        let other = manager
            .add_listener(&endpoint(), "switch_1", |_, _| {}, "changed")
            .unwrap();
        assert_eq!(manager.listener_count(), 3);

        assert_eq!(manager.del_listener(id), 2);
        assert_eq!(manager.listener_count(), 1);
        assert_eq!(manager.del_listener(id), 0);
        assert_eq!(manager.del_listener(other), 1);
    }

    #[test]
    fn test_clean_close_keeps_context_and_reports_unauthorized() {
        let mut observer = MockTransportObserver::new();
        observer
            .expect_on_error()
            .withf(|_, e| matches!(e, WsError::ConnectionClosed { clean: true, code: 4001, .. }))
            .times(1)
            .return_const(());
        observer
            .expect_on_unauthorized()
            .withf(|id| id == "tab_leader")
            .times(1)
            .return_const(());
        let manager = design_manager(Arc::new(observer));
        let _ = leader_with_socket(&manager, 8);

        manager.inject(ConnectionEvent::Closed {
            conn_id: 8,
            clean: true,
            code: 4001,
            reason: "session expired".to_string(),
        });

        assert_eq!(manager.context_count(), 1);
        assert!(!manager.is_connected());
        assert!(matches!(
            manager.request_list(&endpoint()),
            Err(WsError::NotConnected)
        ));
    }

    #[test]
    fn test_unclean_close_clears_identity_and_context() {
        let manager = design_manager(quiet_observer());
        manager
            .inner
            .env
            .session
            .set(DESIGN_TAB_KEY, "tab_leader");
        let _ = leader_with_socket(&manager, 9);

        manager.inject(ConnectionEvent::Closed {
            conn_id: 9,
            clean: false,
            code: 1006,
            reason: String::new(),
        });

        assert_eq!(manager.context_count(), 0);
        assert_eq!(manager.inner.env.session.get(DESIGN_TAB_KEY), None);
    }

    #[tokio::test]
    async fn test_follower_connect_and_idempotent_teardown() {
        let bus = BusHub::new();
        let lifecycle = PageLifecycle::new();
        let session = Arc::new(MemorySessionStore::new());
        let env = TabEnvironment::preview(bus.clone(), "?parentTabId=abcdef-123")
            .with_session(session.clone())
            .with_lifecycle(lifecycle.clone())
            .with_observer(quiet_observer());
        let manager = TransportManager::new(TransportConfig::default(), env);

        let decision = manager.connect(|| {}).unwrap();
        assert_eq!(decision.role, Role::Follower);
        assert_eq!(decision.tab_id, "abcdef-123");
        assert_eq!(session.get(PREVIEW_TAB_KEY).as_deref(), Some("abcdef-123"));
        assert_eq!(manager.role(), Some(Role::Follower));
        assert_eq!(lifecycle.handler_count(), 1);

        manager.close();
        manager.close();
        lifecycle.unload();
        assert_eq!(manager.context_count(), 0);
        assert_eq!(lifecycle.handler_count(), 0);
    }

    #[test]
    fn test_connect_rejects_invalid_timing_before_any_state_changes() {
        let lifecycle = PageLifecycle::new();
        let session = Arc::new(MemorySessionStore::new());
        let env = TabEnvironment::preview(BusHub::new(), "?parentTabId=abcdef-123")
            .with_session(session.clone())
            .with_lifecycle(lifecycle.clone())
            .with_observer(quiet_observer());
        let config = TransportConfig {
            liveness_check_interval_ms: 0,
            ..TransportConfig::default()
        };
        let manager = TransportManager::new(config, env);

        assert!(matches!(
            manager.connect(|| {}),
            Err(WsError::InvalidConfig(_))
        ));
        assert_eq!(manager.context_count(), 0);
        assert_eq!(lifecycle.handler_count(), 0);
        assert_eq!(session.get(PREVIEW_TAB_KEY), None);
    }

    #[tokio::test]
    async fn test_reconnect_same_id_replaces_context() {
        let lifecycle = PageLifecycle::new();
        let env = TabEnvironment::preview(BusHub::new(), "?parentTabId=abcdef-123")
            .with_lifecycle(lifecycle.clone())
            .with_observer(quiet_observer());
        let manager = TransportManager::new(TransportConfig::default(), env);

        manager.connect(|| {}).unwrap();
        let first = manager
            .inner
            .registry
            .lock()
            .current()
            .and_then(|c| c.socket.clone())
            .unwrap();

        let reconnected = Arc::new(AtomicBool::new(false));
        let r = reconnected.clone();
        let decision = manager
            .connect(move || r.store(true, Ordering::SeqCst))
            .unwrap();
        let second = manager
            .inner
            .registry
            .lock()
            .current()
            .and_then(|c| c.socket.clone())
            .unwrap();

        assert_eq!(decision.tab_id, "abcdef-123");
        assert!(!first.is_open());
        assert!(second.is_open());
        assert_ne!(first.id(), second.id());
        assert_eq!(manager.context_count(), 1);
        assert_eq!(lifecycle.handler_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reconnected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unload_tears_down_context() {
        let lifecycle = PageLifecycle::new();
        let env = TabEnvironment::preview(BusHub::new(), "?parentTabId=abcdef-123")
            .with_lifecycle(lifecycle.clone())
            .with_observer(quiet_observer());
        let manager = TransportManager::new(TransportConfig::default(), env);
        manager.connect(|| {}).unwrap();

        lifecycle.unload();
        lifecycle.unload();
        assert_eq!(manager.context_count(), 0);
        manager.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_reports_missing_leader_once() {
        let mut observer = MockTransportObserver::new();
        observer
            .expect_on_error()
            .withf(|_, e| matches!(e, WsError::LeaderDisconnected))
            .times(1)
            .return_const(());
        let env = TabEnvironment::preview(BusHub::new(), "?parentTabId=abcdef-123")
            .with_observer(Arc::new(observer));
        let manager = TransportManager::new(TransportConfig::default(), env);

        let connected = Arc::new(AtomicBool::new(false));
        let c = connected.clone();
        manager
            .connect(move || c.store(true, Ordering::SeqCst))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(connected.load(Ordering::SeqCst));
        drop(manager);
    }
}
