//! In-memory device simulation, one device table per ExEn.

use crate::config::DeviceSeed;
use dashmap::DashMap;
use gum_core::{Action, Endpoint};
use gum_ws::{decode_request, encode_event};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Where a reply goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Back to the requesting connection only.
    Sender(String),
    /// To every connection.
    Broadcast(String),
}

/// Device tables keyed by ExEn address.
pub struct DeviceStore {
    seeds: Vec<DeviceSeed>,
    exens: DashMap<String, BTreeMap<String, Value>>,
}

impl DeviceStore {
    pub fn new(seeds: Vec<DeviceSeed>) -> Self {
        Self {
            seeds,
            exens: DashMap::new(),
        }
    }

    /// Current value of a device, if the ExEn has it.
    pub fn value(&self, endpoint: &Endpoint, name: &str) -> Option<Value> {
        self.with_table(endpoint, |table| table.get(name).cloned())
    }

    fn with_table<R>(
        &self,
        endpoint: &Endpoint,
        f: impl FnOnce(&mut BTreeMap<String, Value>) -> R,
    ) -> R {
        let mut table = self.exens.entry(endpoint.to_string()).or_insert_with(|| {
            self.seeds
                .iter()
                .map(|s| (s.name.clone(), s.value.clone()))
                .collect()
        });
        f(&mut table)
    }

    /// Answer one client frame.
    pub fn handle(&self, text: &str) -> Option<Reply> {
        let request = match decode_request(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(%e, "Unreadable request");
                return error_reply(&Endpoint::default(), "", &e.to_string());
            }
        };
        let endpoint = request.endpoint;
        let name = request
            .payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        debug!(exen = %endpoint, action = %request.action, %name, "Request");

        match request.action {
            Action::List => {
                let listed: Vec<Value> = self.with_table(&endpoint, |table| {
                    table
                        .iter()
                        .map(|(name, value)| json!({ "name": name, "value": value }))
                        .collect()
                });
                event(&endpoint, Action::Listed, Value::Array(listed)).map(Reply::Sender)
            }
            Action::Read => match self.value(&endpoint, &name) {
                Some(value) => event(
                    &endpoint,
                    Action::Readed,
                    json!({ "name": name, "value": value }),
                )
                .map(Reply::Sender),
                None => error_reply(&endpoint, &name, "unknown device"),
            },
            Action::Change => {
                let value = request.payload.get("value").cloned().unwrap_or(Value::Null);
                let known = self.with_table(&endpoint, |table| match table.get_mut(&name) {
                    Some(slot) => {
                        *slot = value.clone();
                        true
                    }
                    None => false,
                });
                if !known {
                    return error_reply(&endpoint, &name, "unknown device");
                }
                event(
                    &endpoint,
                    Action::Changed,
                    json!({ "name": name, "value": value }),
                )
                .map(Reply::Broadcast)
            }
            Action::Execute => event(
                &endpoint,
                Action::Changed,
                json!({ "name": name, "value": { "executed": true } }),
            )
            .map(Reply::Broadcast),
            other => error_reply(&endpoint, &name, &format!("unsupported action {other}")),
        }
    }
}

fn event(endpoint: &Endpoint, action: Action, payload: Value) -> Option<String> {
    match encode_event(endpoint, action, payload) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(%e, "Failed to encode reply");
            None
        }
    }
}

fn error_reply(endpoint: &Endpoint, name: &str, message: &str) -> Option<Reply> {
    event(
        endpoint,
        Action::Error,
        json!({ "name": name, "message": message }),
    )
    .map(Reply::Sender)
}
