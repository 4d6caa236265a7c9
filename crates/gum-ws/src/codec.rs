//! Une envelope codec.
//!
//! Outbound frames: `{"exen": {...}, "msg": {"<Action>": payload}}`.
//! Inbound frames:  `{"exen": {...}, "<Action>": payload}`.

use gum_core::{coerce_value, Action, ActuatorValue, Endpoint, GumError};
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Outbound envelope.
#[derive(Debug, Serialize)]
struct OutboundEnvelope<'a> {
    exen: &'a Endpoint,
    msg: Map<String, Value>,
}

/// Decoded inbound frame.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub endpoint: Endpoint,
    pub action: Action,
    /// Action key exactly as the server spelled it.
    pub raw_action: String,
    pub payload: Value,
}

impl InboundFrame {
    /// Lower-cased action name used for listener matching.
    pub fn action_name(&self) -> String {
        self.raw_action.to_ascii_lowercase()
    }

    /// Device the frame is about; empty when the payload names none.
    pub fn device_name(&self) -> &str {
        self.payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

/// Encode a request for `endpoint`.
pub fn encode_request(
    endpoint: &Endpoint,
    action: Action,
    payload: Value,
) -> Result<String, GumError> {
    let mut msg = Map::new();
    msg.insert(action.as_str().to_string(), payload);
    Ok(serde_json::to_string(&OutboundEnvelope {
        exen: endpoint,
        msg,
    })?)
}

pub fn encode_list_request(endpoint: &Endpoint) -> Result<String, GumError> {
    encode_request(endpoint, Action::List, json!({}))
}

pub fn encode_read_request(endpoint: &Endpoint, device_name: &str) -> Result<String, GumError> {
    encode_request(endpoint, Action::Read, json!({ "name": device_name }))
}

pub fn encode_execute_request(endpoint: &Endpoint, name: &str) -> Result<String, GumError> {
    encode_request(endpoint, Action::Execute, json!({ "name": name }))
}

/// Encode a `Change`, coercing the value first.
///
/// An unknown declared type fails here, before anything is sent.
pub fn encode_change_request(
    endpoint: &Endpoint,
    actuator_name: &str,
    value: &ActuatorValue,
    declared_type: Option<&str>,
) -> Result<String, GumError> {
    let coerced = coerce_value(value, declared_type)?;
    encode_request(
        endpoint,
        Action::Change,
        json!({ "name": actuator_name, "value": coerced }),
    )
}

/// Decode a server frame.
///
/// The payload is read with the key as sent, and only then is the action
/// name lower-cased; payload keys themselves are never normalized.
pub fn decode_inbound(text: &str) -> Result<InboundFrame, GumError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(obj) = value else {
        return Err(GumError::Parse("frame is not an object".to_string()));
    };

    let endpoint = match obj.get("exen") {
        Some(exen) => Endpoint::parse(exen)?,
        None => Endpoint::default(),
    };

    let (raw_action, action) = obj
        .keys()
        .filter(|k| k.as_str() != "exen")
        .find_map(|k| {
            Action::ALL
                .iter()
                .find(|a| a.as_str().eq_ignore_ascii_case(k))
                .map(|a| (k.clone(), *a))
        })
        .ok_or_else(|| GumError::Parse("frame carries no known action".to_string()))?;

    let payload = obj.get(&raw_action).cloned().unwrap_or(Value::Null);

    Ok(InboundFrame {
        endpoint,
        action,
        raw_action,
        payload,
    })
}

/// Encode a frame in the shape the server sends.
pub fn encode_event(endpoint: &Endpoint, action: Action, payload: Value) -> Result<String, GumError> {
    let mut obj = Map::new();
    obj.insert("exen".to_string(), endpoint.to_value());
    obj.insert(action.as_str().to_string(), payload);
    Ok(serde_json::to_string(&Value::Object(obj))?)
}

/// A client request as the server sees it.
#[derive(Debug, Clone)]
pub struct Request {
    pub endpoint: Endpoint,
    pub action: Action,
    pub payload: Value,
}

/// Decode a client request (`{"exen":..,"msg":{"<Action>":..}}`).
pub fn decode_request(text: &str) -> Result<Request, GumError> {
    let value: Value = serde_json::from_str(text)?;
    let endpoint = match value.get("exen") {
        Some(exen) => Endpoint::parse(exen)?,
        None => Endpoint::default(),
    };
    let msg = value
        .get("msg")
        .and_then(Value::as_object)
        .ok_or_else(|| GumError::Parse("request carries no msg object".to_string()))?;
    let (action, payload) = msg
        .iter()
        .find_map(|(k, v)| Action::from_key(k).map(|a| (a, v.clone())))
        .ok_or_else(|| GumError::Parse("request carries no known action".to_string()))?;

    Ok(Request {
        endpoint,
        action,
        payload,
    })
}
