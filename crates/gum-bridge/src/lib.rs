//! Development bridge for gum-boards dashboards.
//!
//! - `server`: axum WebSocket bridge with one connection per tab id and a
//!   simulated device table per ExEn
//! - `watch`: headless design and preview tabs that log traffic
//! - `config`: TOML configuration with environment overrides

pub mod config;
pub mod devices;
pub mod error;
pub mod server;
pub mod watch;

pub use crate::config::{AppConfig, BridgeServerConfig, DeviceSeed};
pub use error::{BridgeError, BridgeResult};
pub use server::{BridgeServer, BridgeState};
pub use watch::{run_watch, WatchOptions};
