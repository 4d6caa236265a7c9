//! Une value typing and coercion for `Change` requests.
//!
//! Gadgets hand actuator values over loosely typed (form inputs are strings).
//! Before a `Change` leaves the tab the value is either coerced to the type
//! the gadget declared or, when none was declared, to a type inferred from
//! the value itself.

use crate::error::{GumError, Result};
use chrono::{DateTime, Local, NaiveTime, Timelike, Utc};
use serde_json::{json, Number, Value};
use std::fmt;
use std::str::FromStr;

/// Une value types understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Boolean,
    Number,
    String,
    Date,
    Time,
    List,
    Pair,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::Date => "date",
            Self::Time => "time",
            Self::List => "list",
            Self::Pair => "pair",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = GumError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "boolean" => Ok(Self::Boolean),
            "number" => Ok(Self::Number),
            "string" => Ok(Self::String),
            "date" => Ok(Self::Date),
            "time" => Ok(Self::Time),
            "list" => Ok(Self::List),
            "pair" => Ok(Self::Pair),
            _ => Err(GumError::UnknownValueType(s.to_string())),
        }
    }
}

/// Value handed to `request_change`.
#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorValue {
    Json(Value),
    Date(DateTime<Utc>),
    Time(NaiveTime),
}

impl From<Value> for ActuatorValue {
    fn from(v: Value) -> Self {
        Self::Json(v)
    }
}

impl From<&str> for ActuatorValue {
    fn from(s: &str) -> Self {
        Self::Json(Value::String(s.to_string()))
    }
}

impl From<String> for ActuatorValue {
    fn from(s: String) -> Self {
        Self::Json(Value::String(s))
    }
}

impl From<bool> for ActuatorValue {
    fn from(b: bool) -> Self {
        Self::Json(Value::Bool(b))
    }
}

impl From<f64> for ActuatorValue {
    fn from(n: f64) -> Self {
        Self::Json(number_value(n))
    }
}

impl From<DateTime<Utc>> for ActuatorValue {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

impl From<NaiveTime> for ActuatorValue {
    fn from(t: NaiveTime) -> Self {
        Self::Time(t)
    }
}

/// Infer the Une type of a value.
///
/// Returns the raw runtime type name when nothing fits, so the caller can
/// report it as an unknown type.
pub fn infer_type(value: &ActuatorValue) -> std::result::Result<ValueType, &'static str> {
    match value {
        ActuatorValue::Date(_) => Ok(ValueType::Date),
        ActuatorValue::Time(_) => Ok(ValueType::Time),
        ActuatorValue::Json(v) => match v {
            Value::String(s) => {
                let t = s.trim().to_ascii_lowercase();
                if t == "true" || t == "false" {
                    Ok(ValueType::Boolean)
                } else if parse_float(s).is_some() {
                    Ok(ValueType::Number)
                } else {
                    Ok(ValueType::String)
                }
            }
            Value::Array(_) => Ok(ValueType::List),
            Value::Object(_) => Ok(ValueType::Pair),
            Value::Bool(_) => Ok(ValueType::Boolean),
            Value::Number(_) => Ok(ValueType::Number),
            Value::Null => Err("null"),
        },
    }
}

/// Coerce a value to the declared (or inferred) Une type.
///
/// Fails with `UnknownValueType` when the declared type is not recognized
/// or when inference yields no Une type.
pub fn coerce_value(value: &ActuatorValue, declared: Option<&str>) -> Result<Value> {
    let ty = match declared {
        Some(name) => name.parse::<ValueType>()?,
        None => infer_type(value).map_err(|raw| GumError::UnknownValueType(raw.to_string()))?,
    };

    let coerced = match ty {
        ValueType::Boolean => Value::Bool(text_of(value).trim().to_ascii_lowercase() == "true"),
        ValueType::Number => match value {
            ActuatorValue::Json(Value::Number(n)) => Value::Number(n.clone()),
            _ => parse_float(&text_of(value)).map_or(Value::Null, number_value),
        },
        ValueType::String => match value {
            ActuatorValue::Json(Value::String(s)) => Value::String(s.clone()),
            _ => Value::String(text_of(value)),
        },
        ValueType::Date => json!({ "class": "date", "data": epoch_millis(value) }),
        ValueType::Time => json!({
            "class": "time",
            "data": millis_since_midnight(value).map_or(Value::Null, |ms| number_value(ms / 1000.0)),
        }),
        ValueType::List => json!({ "class": "list", "data": raw_json(value) }),
        ValueType::Pair => json!({ "class": "pair", "data": raw_json(value) }),
    };

    Ok(coerced)
}

/// Leading-float parse: skips leading whitespace and reads the longest
/// numeric prefix, so `"42abc"` yields 42. Returns `None` for NaN.
pub fn parse_float(s: &str) -> Option<f64> {
    let t = s.trim_start();
    let bytes = t.as_bytes();
    let mut end = 0;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    if t[end..].starts_with("Infinity") {
        let sign = if t.starts_with('-') { -1.0 } else { 1.0 };
        return Some(sign * f64::INFINITY);
    }

    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }
    if digits == 0 {
        return None;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    t[..end].parse::<f64>().ok()
}

/// JSON number for `n`; integral values serialize without a fraction,
/// non-finite values become `null`.
fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn text_of(value: &ActuatorValue) -> String {
    match value {
        ActuatorValue::Json(Value::String(s)) => s.clone(),
        ActuatorValue::Json(other) => other.to_string(),
        ActuatorValue::Date(d) => d.to_rfc3339(),
        ActuatorValue::Time(t) => t.format("%H:%M:%S").to_string(),
    }
}

fn raw_json(value: &ActuatorValue) -> Value {
    match value {
        ActuatorValue::Json(v) => v.clone(),
        ActuatorValue::Date(d) => Value::String(d.to_rfc3339()),
        ActuatorValue::Time(t) => Value::String(t.format("%H:%M:%S").to_string()),
    }
}

fn epoch_millis(value: &ActuatorValue) -> Value {
    match value {
        ActuatorValue::Date(d) => Value::from(d.timestamp_millis()),
        ActuatorValue::Json(Value::Number(n)) => Value::Number(n.clone()),
        ActuatorValue::Json(Value::String(s)) => DateTime::parse_from_rfc3339(s.trim())
            .map_or(Value::Null, |d| Value::from(d.timestamp_millis())),
        _ => Value::Null,
    }
}

fn millis_since_midnight(value: &ActuatorValue) -> Option<f64> {
    let time = match value {
        ActuatorValue::Time(t) => *t,
        ActuatorValue::Date(d) => d.with_timezone(&Local).time(),
        ActuatorValue::Json(Value::Number(n)) => return n.as_f64(),
        ActuatorValue::Json(Value::String(s)) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M"))
            .ok()?,
        _ => return None,
    };
    let ms = u64::from(time.num_seconds_from_midnight()) * 1000
        + u64::from(time.nanosecond() / 1_000_000);
    Some(ms as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_numeric_string_is_sent_as_number() {
        let v = coerce_value(&"42".into(), None).unwrap();
        assert_eq!(v, json!(42));
        assert_eq!(serde_json::to_string(&v).unwrap(), "42");
    }

    #[test]
    fn test_boolean_string_inference() {
        assert_eq!(coerce_value(&"true".into(), None).unwrap(), json!(true));
        assert_eq!(coerce_value(&" FALSE ".into(), None).unwrap(), json!(false));
    }

    #[test]
    fn test_list_and_pair_wrapping() {
        let list = coerce_value(&ActuatorValue::Json(json!([1, 2])), None).unwrap();
        assert_eq!(list, json!({"class": "list", "data": [1, 2]}));

        let pair = coerce_value(&ActuatorValue::Json(json!({"k": "v"})), None).unwrap();
        assert_eq!(pair, json!({"class": "pair", "data": {"k": "v"}}));
    }

    #[test]
    fn test_plain_string_stays_string() {
        assert_eq!(coerce_value(&"hello".into(), None).unwrap(), json!("hello"));
    }

    #[test]
    fn test_declared_type_overrides_inference() {
        assert_eq!(
            coerce_value(&"42".into(), Some("string")).unwrap(),
            json!("42")
        );
        assert_eq!(
            coerce_value(&"3.5 volts".into(), Some("number")).unwrap(),
            json!(3.5)
        );
        assert_eq!(
            coerce_value(&"yes".into(), Some("boolean")).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn test_unknown_declared_type_fails() {
        let err = coerce_value(&"1".into(), Some("matrix")).unwrap_err();
        assert!(matches!(err, GumError::UnknownValueType(ref t) if t == "matrix"));
    }

    #[test]
    fn test_null_has_no_inferred_type() {
        let err = coerce_value(&ActuatorValue::Json(Value::Null), None).unwrap_err();
        assert!(matches!(err, GumError::UnknownValueType(ref t) if t == "null"));
    }

    #[test]
    fn test_date_coercion_uses_epoch_millis() {
        let d = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let v = coerce_value(&d.into(), None).unwrap();
        assert_eq!(v, json!({"class": "date", "data": d.timestamp_millis()}));
    }

    #[test]
    fn test_time_coercion_is_seconds_since_midnight() {
        let t = NaiveTime::from_hms_opt(1, 0, 30).unwrap();
        let v = coerce_value(&t.into(), None).unwrap();
        assert_eq!(v, json!({"class": "time", "data": 3630}));

        let from_text = coerce_value(&"00:01".into(), Some("time")).unwrap();
        assert_eq!(from_text, json!({"class": "time", "data": 60}));
    }

    #[test]
    fn test_parse_float_prefix_semantics() {
        assert_eq!(parse_float("42"), Some(42.0));
        assert_eq!(parse_float("  -1.5e2xyz"), Some(-150.0));
        assert_eq!(parse_float(".5"), Some(0.5));
        assert_eq!(parse_float("7e"), Some(7.0));
        assert_eq!(parse_float("abc"), None);
        assert_eq!(parse_float("."), None);
        assert_eq!(parse_float(""), None);
    }
}
