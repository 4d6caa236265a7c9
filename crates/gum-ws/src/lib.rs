//! Multi-tab WebSocket sharing for gum-boards dashboards.
//!
//! A design tab leads: it owns the single server connection for its tab id
//! and relays every frame over an inter-tab bus. Preview tabs spawned from
//! it follow: they proxy requests through the leader and watch its
//! heartbeat.
//!
//! - `TransportManager`: the per-tab entry point
//! - `tab_id`: identity and role resolution
//! - `codec`: Une envelope encoding and decoding
//! - `bus`, `proxy`, `heartbeat`: the leader/follower link
//! - `listener`, `context`, `lifecycle`: dispatch and cleanup

pub mod bus;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod listener;
pub mod manager;
pub mod observer;
pub mod proxy;
pub mod tab_id;

pub use bus::{BusHub, BusMessage, BusPort, BusReceiver};
pub use codec::{
    decode_inbound, decode_request, encode_change_request, encode_event, encode_request,
    InboundFrame, Request,
};
pub use config::TransportConfig;
pub use connection::{Connection, ConnectionEvent, ConnectionId, ConnectionKind, RealConnection};
pub use context::{ConnectionContext, ContextRegistry, Role};
pub use error::{WsError, WsResult};
pub use heartbeat::{spawn_leader_heartbeat, LivenessMonitor};
pub use lifecycle::{PageLifecycle, UnloadHandlerId};
pub use listener::{pattern_matches, Listener, ListenerCallback};
pub use manager::{DeviceNames, ListCallback, TabEnvironment, TransportManager, ANY_ACTION};
pub use observer::{LoggingObserver, TransportObserver};
pub use proxy::ChannelProxyConnection;
pub use tab_id::{
    clear_tab_id, parent_tab_id, resolve_role, resolve_tab_id, MemorySessionStore, RoleDecision,
    SessionStore,
};
