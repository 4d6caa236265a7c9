//! Bridge configuration.
//!
//! Loaded from a TOML file and layered with `GUM__*` environment overrides,
//! e.g. `GUM__SERVER__PORT=9000` or `GUM__TRANSPORT__LEADER_TIMEOUT_MS=30000`.

use crate::error::{BridgeError, BridgeResult};
use gum_ws::TransportConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Client-side transport settings, used by `watch`.
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub server: BridgeServerConfig,
}

/// Development bridge server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Must match the transport's `bridge_path`.
    #[serde(default = "default_bridge_path")]
    pub bridge_path: String,
    /// Maximum concurrent WebSocket connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Devices every ExEn starts with.
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceSeed>,
}

/// Initial state of one simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSeed {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_bridge_path() -> String {
    "gum/bridge".to_string()
}

fn default_max_connections() -> usize {
    64
}

fn default_devices() -> Vec<DeviceSeed> {
    vec![
        DeviceSeed {
            name: "light_A1".to_string(),
            value: Value::Bool(false),
        },
        DeviceSeed {
            name: "dimmer_A1".to_string(),
            value: Value::from(0),
        },
    ]
}

impl Default for BridgeServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            bridge_path: default_bridge_path(),
            max_connections: default_max_connections(),
            devices: default_devices(),
        }
    }
}

impl BridgeServerConfig {
    pub fn socket_addr(&self) -> BridgeResult<SocketAddr> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .map_err(|e| BridgeError::Config(format!("invalid bind address: {e}")))
    }

    /// Route for WebSocket upgrades, e.g. `/gum/bridge/{tab_id}`.
    pub fn route(&self) -> String {
        format!("/{}/{{tab_id}}", self.bridge_path.trim_matches('/'))
    }
}

impl AppConfig {
    /// Parse a TOML file on its own, without environment overrides.
    pub fn from_file(path: &str) -> BridgeResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` (optional) layered with `GUM__*` environment variables.
    pub fn load(path: &str) -> BridgeResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix("GUM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        self.transport.validate()?;
        if self.server.max_connections == 0 {
            return Err(BridgeError::Config(
                "max_connections must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gum_ws::WsError;

    #[test]
    fn test_defaults_line_up_with_transport() {
        let config = AppConfig::default();
        assert_eq!(config.server.bridge_path, config.transport.bridge_path);
        assert_eq!(config.server.route(), "/gum/bridge/{tab_id}");
        assert_eq!(
            config.server.socket_addr().unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [server]
            port = 9100

            [[server.devices]]
            name = "switch_1"
            value = true

            [transport]
            leader_timeout_ms = 30000
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert_eq!(
            config.server.devices,
            vec![DeviceSeed {
                name: "switch_1".to_string(),
                value: Value::Bool(true)
            }]
        );
        assert_eq!(config.transport.leader_timeout_ms, 30_000);
        assert_eq!(config.transport.heartbeat_interval_ms, 5_000);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = AppConfig::load("does/not/exist.toml").unwrap();
        assert_eq!(config.server.max_connections, 64);
    }

    #[test]
    fn test_load_rejects_zero_liveness_interval() {
        let path = std::env::temp_dir().join(format!("gum-bridge-{}.toml", std::process::id()));
        std::fs::write(&path, "[transport]\nliveness_check_interval_ms = 0\n").unwrap();
        let path = path.to_string_lossy().to_string();

        let loaded = AppConfig::load(&path);
        let parsed = AppConfig::from_file(&path);
        let _ = std::fs::remove_file(&path);

        assert!(matches!(
            loaded,
            Err(BridgeError::Transport(WsError::InvalidConfig(_)))
        ));
        assert!(matches!(
            parsed,
            Err(BridgeError::Transport(WsError::InvalidConfig(_)))
        ));
    }

    #[test]
    fn test_from_file_missing_is_config_error() {
        assert!(matches!(
            AppConfig::from_file("does/not/exist.toml"),
            Err(BridgeError::Config(_))
        ));
    }
}
