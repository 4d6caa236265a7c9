//! Transport configuration.

use crate::error::{WsError, WsResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Multi-tab transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Base WebSocket URL of the bridge (scheme, host, port).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Path under which the bridge accepts `/<bridge_path>/<tab_id>`.
    #[serde(default = "default_bridge_path")]
    pub bridge_path: String,
    /// Prefix of the inter-tab bus name (`<prefix>_<tab_id>`).
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    /// Leader heartbeat period on the bus.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Follower liveness polling period.
    #[serde(default = "default_liveness_check_interval_ms")]
    pub liveness_check_interval_ms: u64,
    /// Silence after which a follower reports its leader gone.
    #[serde(default = "default_leader_timeout_ms")]
    pub leader_timeout_ms: u64,
    /// Delay before a follower reports itself connected.
    #[serde(default = "default_connect_tick_ms")]
    pub connect_tick_ms: u64,
}

fn default_base_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}

fn default_bridge_path() -> String {
    "gum/bridge".to_string()
}

fn default_channel_prefix() -> String {
    "gum_ws_boards".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_liveness_check_interval_ms() -> u64 {
    5_000
}

fn default_leader_timeout_ms() -> u64 {
    15_000
}

fn default_connect_tick_ms() -> u64 {
    10
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            bridge_path: default_bridge_path(),
            channel_prefix: default_channel_prefix(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            liveness_check_interval_ms: default_liveness_check_interval_ms(),
            leader_timeout_ms: default_leader_timeout_ms(),
            connect_tick_ms: default_connect_tick_ms(),
        }
    }
}

impl TransportConfig {
    /// Bus name shared by every tab of one dashboard instance.
    pub fn channel_name(&self, tab_id: &str) -> String {
        format!("{}_{}", self.channel_prefix, tab_id)
    }

    /// Server URL for a leader, with a cache-busting query parameter.
    pub fn server_url(&self, tab_id: &str, cache_buster: i64) -> WsResult<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| WsError::ConnectionFailed(format!("invalid base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| WsError::ConnectionFailed("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(self.bridge_path.split('/').filter(|s| !s.is_empty()))
            .push(tab_id);
        url.query_pairs_mut()
            .append_pair("_", &cache_buster.to_string());
        Ok(url)
    }

    /// Validate timing values.
    ///
    /// Returns Err if:
    /// - any period is zero
    /// - leader_timeout_ms < liveness_check_interval_ms
    /// - leader_timeout_ms <= heartbeat_interval_ms
    pub fn validate(&self) -> WsResult<()> {
        let periods = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("liveness_check_interval_ms", self.liveness_check_interval_ms),
            ("leader_timeout_ms", self.leader_timeout_ms),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, ms)| *ms == 0) {
            return Err(WsError::InvalidConfig(format!("{name} must be positive")));
        }

        if self.leader_timeout_ms < self.liveness_check_interval_ms {
            return Err(WsError::InvalidConfig(format!(
                "leader_timeout_ms ({}) must not be below liveness_check_interval_ms ({})",
                self.leader_timeout_ms, self.liveness_check_interval_ms
            )));
        }

        // A live leader must beat at least once per timeout window.
        if self.leader_timeout_ms <= self.heartbeat_interval_ms {
            return Err(WsError::InvalidConfig(format!(
                "leader_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.leader_timeout_ms, self.heartbeat_interval_ms
            )));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms)
    }

    pub fn leader_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_timeout_ms)
    }

    pub fn connect_tick(&self) -> Duration {
        Duration::from_millis(self.connect_tick_ms)
    }
}
