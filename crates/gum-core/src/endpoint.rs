//! ExEn endpoint addresses.
//!
//! Endpoints arrive either as JSON objects (`{"host":..,"port":..,"ssl":..}`)
//! or as JSON strings whose quotes were escaped on the way through HTML
//! attributes (`{\"host\":\"...\"}`). Both normalize to an object.
//!
//! Equality is loose: leaves compare the way the dashboards
//! always have, so `"8080"` and `8080` name the same port.

use crate::error::{GumError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Address of an execution environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(Map<String, Value>);

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, ssl: bool) -> Self {
        let mut map = Map::new();
        map.insert("host".to_string(), Value::String(host.into()));
        map.insert("port".to_string(), Value::from(port));
        map.insert("ssl".to_string(), Value::Bool(ssl));
        Self(map)
    }

    /// Normalize an endpoint given as an object or as an (escaped) JSON string.
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map.clone())),
            Value::String(s) => Self::parse_str(s),
            other => Err(GumError::InvalidEndpoint(format!(
                "expected object or string, got {other}"
            ))),
        }
    }

    /// Parse a JSON string form, unescaping `\"` first.
    pub fn parse_str(s: &str) -> Result<Self> {
        let unescaped = s.replace("\\\"", "\"");
        match serde_json::from_str::<Value>(&unescaped) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(GumError::InvalidEndpoint(format!(
                "not an object: {other}"
            ))),
            Err(e) => Err(GumError::InvalidEndpoint(format!("{e}: {s}"))),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.0.get("host").and_then(Value::as_str)
    }

    /// Port, accepting numeric strings.
    pub fn port(&self) -> Option<u16> {
        match self.0.get("port")? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn ssl(&self) -> bool {
        match self.0.get("ssl") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Structural, key-order independent, loose comparison.
    pub fn loosely_equals(&self, other: &Endpoint) -> bool {
        objects_loose_eq(&self.0, &other.0)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.host(), self.port()) {
            (Some(host), Some(port)) => write!(f, "{host}:{port}"),
            _ => write!(f, "{}", self.to_value()),
        }
    }
}

/// Anything a caller may pass where an endpoint is expected.
pub trait IntoEndpoint {
    fn into_endpoint(self) -> Result<Endpoint>;
}

impl IntoEndpoint for Endpoint {
    fn into_endpoint(self) -> Result<Endpoint> {
        Ok(self)
    }
}

impl IntoEndpoint for &Endpoint {
    fn into_endpoint(self) -> Result<Endpoint> {
        Ok(self.clone())
    }
}

impl IntoEndpoint for &Value {
    fn into_endpoint(self) -> Result<Endpoint> {
        Endpoint::parse(self)
    }
}

impl IntoEndpoint for Value {
    fn into_endpoint(self) -> Result<Endpoint> {
        Endpoint::parse(&self)
    }
}

impl IntoEndpoint for &str {
    fn into_endpoint(self) -> Result<Endpoint> {
        Endpoint::parse_str(self)
    }
}

fn objects_loose_eq(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(k, va)| b.get(k).is_some_and(|vb| loose_eq(va, vb)))
}

/// Loose equality over JSON values.
///
/// Objects and arrays compare recursively. Primitive leaves follow the
/// abstract-equality rules of the dashboards: numbers, numeric strings and
/// booleans compare numerically, `null` only equals `null`.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => objects_loose_eq(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| loose_eq(l, r))
        }
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Object(_) | Value::Array(_), _) | (_, Value::Object(_) | Value::Array(_)) => false,
        _ => match (leaf_number(a), leaf_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn leaf_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                Some(0.0)
            } else {
                t.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_escaped_string() {
        let raw = Value::String(r#"{\"host\":\"localhost\",\"port\":8080,\"ssl\":false}"#.into());
        let ep = Endpoint::parse(&raw).unwrap();
        assert_eq!(ep.host(), Some("localhost"));
        assert_eq!(ep.port(), Some(8080));
        assert!(!ep.ssl());
    }

    #[test]
    fn test_parse_malformed_string_fails() {
        let raw = Value::String("{host: nope".into());
        assert!(matches!(
            Endpoint::parse(&raw),
            Err(GumError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_parse_rejects_numbers() {
        assert!(Endpoint::parse(&json!(42)).is_err());
    }

    #[test]
    fn test_loose_equality_ignores_key_order_and_types() {
        let a = Endpoint::parse(&json!({"host": "h", "port": 8080, "ssl": false})).unwrap();
        let b = Endpoint::parse(&json!({"ssl": false, "port": "8080", "host": "h"})).unwrap();
        assert!(a.loosely_equals(&b));
    }

    #[test]
    fn test_loose_equality_detects_differences() {
        let a = Endpoint::new("h", 8080, false);
        let b = Endpoint::new("h", 8081, false);
        let c = Endpoint::new("other", 8080, false);
        assert!(!a.loosely_equals(&b));
        assert!(!a.loosely_equals(&c));
    }

    #[test]
    fn test_loose_eq_leaves() {
        assert!(loose_eq(&json!(true), &json!(1)));
        assert!(loose_eq(&json!("1"), &json!(true)));
        assert!(loose_eq(&json!(""), &json!(0)));
        assert!(!loose_eq(&json!(null), &json!(0)));
        assert!(!loose_eq(&json!("true"), &json!(true)));
        assert!(loose_eq(&json!({"a": [1, "2"]}), &json!({"a": ["1", 2]})));
    }
}
