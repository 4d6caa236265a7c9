//! Listener registration and wildcard matching.

use crate::codec::InboundFrame;
use gum_core::Endpoint;
use gum_telemetry::Metrics;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Callback invoked with `(action, payload)`.
pub type ListenerCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// One physical listener entry.
///
/// A subscription over several device names is stored as several entries
/// sharing one `id`.
#[derive(Clone)]
pub struct Listener {
    pub id: Uuid,
    pub callback: ListenerCallback,
    pub endpoint: Endpoint,
    /// Exact name, `*`, or a prefix ending in `*`.
    pub device_name: String,
    /// Lower-case action name, `*`, or a prefix ending in `*`.
    pub action: String,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("device_name", &self.device_name)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// `*` matches anything, `prefix*` matches by prefix, otherwise exact.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" || pattern == value {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => false,
    }
}

impl Listener {
    pub fn matches(&self, action: &str, device_name: &str, endpoint: &Endpoint) -> bool {
        pattern_matches(&self.action, action)
            && pattern_matches(&self.device_name, device_name)
            && self.endpoint.loosely_equals(endpoint)
    }
}

/// Invoke every listener matching `frame`. Returns how many were invoked.
///
/// A panicking callback is logged and does not stop the others.
pub fn dispatch(listeners: &[Listener], frame: &InboundFrame) -> usize {
    let action = frame.action_name();
    let device = frame.device_name();
    let mut invoked = 0;

    for listener in listeners
        .iter()
        .filter(|l| l.matches(&action, device, &frame.endpoint))
    {
        let callback = &listener.callback;
        let outcome = catch_unwind(AssertUnwindSafe(|| callback(&action, &frame.payload)));
        if outcome.is_err() {
            error!(listener_id = %listener.id, %action, device, "Listener callback panicked");
        }
        Metrics::listener_dispatched(&action);
        invoked += 1;
    }

    invoked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_inbound;
    use parking_lot::Mutex;

    fn endpoint() -> Endpoint {
        Endpoint::new("exen", 8080, false)
    }

    fn listener(device: &str, action: &str, seen: Arc<Mutex<Vec<String>>>) -> Listener {
        Listener {
            id: Uuid::new_v4(),
            callback: Arc::new(move |action, payload| {
                seen.lock().push(format!("{action}:{}", payload["name"]));
            }),
            endpoint: endpoint(),
            device_name: device.to_string(),
            action: action.to_string(),
        }
    }

    #[test]
    fn test_pattern_rules() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("light_A1", "light_A1"));
        assert!(pattern_matches("light_*", "light_A1"));
        assert!(pattern_matches("light_*", "light_"));
        assert!(!pattern_matches("light_*", "switch_1"));
        assert!(!pattern_matches("light", "light_A1"));
    }

    #[test]
    fn test_wildcard_device_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let l = listener("light_*", "*", seen);
        assert!(l.matches("changed", "light_A1", &endpoint()));
        assert!(l.matches("readed", "light_kitchen", &endpoint()));
        assert!(!l.matches("changed", "switch_1", &endpoint()));
        assert!(!l.matches("changed", "light_A1", &Endpoint::new("other", 8080, false)));
    }

    #[test]
    fn test_dispatch_reaches_every_match_and_survives_panics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let panicking = Listener {
            id: Uuid::new_v4(),
            callback: Arc::new(|_, _| panic!("gadget bug")),
            endpoint: endpoint(),
            device_name: "*".to_string(),
            action: "*".to_string(),
        };
        let listeners = vec![
            panicking,
            listener("light_*", "changed", seen.clone()),
            listener("light_A1", "chan*", seen.clone()),
            listener("switch_*", "*", seen.clone()),
        ];

        let frame = decode_inbound(
            r#"{"exen":{"host":"exen","port":"8080","ssl":false},"Changed":{"name":"light_A1","value":1}}"#,
        )
        .unwrap();

        assert_eq!(dispatch(&listeners, &frame), 3);
        assert_eq!(
            *seen.lock(),
            vec![
                "changed:\"light_A1\"".to_string(),
                "changed:\"light_A1\"".to_string()
            ]
        );
    }
}
