//! Loosely-typed data flowing through the pipeline.
//!
//! Parsed API responses, stored snapshots and template contexts all share
//! one tagged union so path resolution and truthiness have a single,
//! precise definition instead of relying on JSON coercions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use serde_json::Number;

/// A dynamically-typed value.
///
/// Mappings are sorted by key, so two mappings with the same entries compare
/// equal regardless of the order the source emitted them in. Numbers keep
/// their source representation: integers beyond 2^53 stay exact.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    String(String),
    Number(Number),
    Bool(bool),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
    /// An explicit `null`, or a value the source did not provide.
    #[default]
    Absent,
}

impl Value {
    /// Template truthiness: absent, `false`, zero, and empty strings or
    /// collections are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::String(s) => !s.is_empty(),
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::Bool(b) => *b,
            Value::Sequence(items) => !items.is_empty(),
            Value::Mapping(map) => !map.is_empty(),
            Value::Absent => false,
        }
    }

    /// Look up a single path segment.
    ///
    /// Supports mapping keys, numeric sequence indices and the `length`
    /// pseudo-property on sequences, strings and mappings.
    pub fn get(&self, segment: &str) -> Option<Value> {
        match self {
            Value::Mapping(map) => match map.get(segment) {
                Some(v) => Some(v.clone()),
                None if segment == "length" => Some(Value::from(map.len())),
                None => None,
            },
            Value::Sequence(items) => {
                if segment == "length" {
                    return Some(Value::from(items.len()));
                }
                segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
            }
            Value::String(s) if segment == "length" => {
                Some(Value::from(s.chars().count()))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Build a mapping from `(key, value)` pairs.
    pub fn mapping<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Mapping(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Renders the value the way it appears inside a digest.
///
/// Integral numbers print without a fractional part, absent values print
/// nothing, and collections print as compact JSON.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Number(n) => write!(f, "{}", format_number(n)),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Absent => Ok(()),
            Value::Sequence(_) | Value::Mapping(_) => {
                write!(f, "{}", serde_json::Value::from(self))
            }
        }
    }
}

// Integer-valued floats print without a fractional part.
fn format_number(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Absent,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Sequence(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Mapping(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Absent => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Sequence(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Mapping(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(Number::from(n))
    }
}

/// Non-finite floats have no JSON form and become [`Value::Absent`].
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Absent)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_json::Value::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Absent.is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(!Value::from(0i64).is_truthy());
        assert!(!Value::from(0.0).is_truthy());
        assert!(Value::from(-1.5).is_truthy());
        assert!(!Value::Sequence(vec![]).is_truthy());
        assert!(!Value::Mapping(BTreeMap::new()).is_truthy());
        assert!(Value::from(true).is_truthy());
    }

    #[test]
    fn test_length_pseudo_property() {
        let v = Value::from(json!({"rows": [1, 2, 3], "name": "héllo"}));
        let rows = v.get("rows").unwrap();
        assert_eq!(rows.get("length"), Some(Value::from(3usize)));
        assert_eq!(
            v.get("name").unwrap().get("length"),
            Some(Value::from(5usize))
        );
        assert_eq!(rows.get("1"), Some(Value::from(2i64)));
        assert_eq!(rows.get("7"), None);
    }

    #[test]
    fn test_null_maps_to_absent() {
        let v = Value::from(json!({"a": null}));
        assert_eq!(v.get("a"), Some(Value::Absent));
        assert_eq!(v.get("b"), None);
    }

    #[test]
    fn test_mapping_equality_ignores_field_order() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": "two"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": "two", "x": 1}"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_display_formats_integers_without_fraction() {
        assert_eq!(Value::from(24i64).to_string(), "24");
        assert_eq!(Value::from(24.0).to_string(), "24");
        assert_eq!(Value::from(0.5).to_string(), "0.5");
        assert_eq!(Value::from(f64::NAN), Value::Absent);
        assert_eq!(Value::Absent.to_string(), "");
    }

    #[test]
    fn test_serialize_keeps_integers_integral() {
        let v = Value::from(json!({"id": 7, "score": 1.25}));
        assert_eq!(
            serde_json::to_value(&v).unwrap(),
            json!({"id": 7, "score": 1.25})
        );
    }

    #[test]
    fn test_large_integers_stay_exact() {
        let a = Value::from(json!({"id": 9007199254740993u64}));
        let b = Value::from(json!({"id": 9007199254740992u64}));
        assert_ne!(a, b);
        assert_eq!(a.get("id").unwrap().to_string(), "9007199254740993");

        let stored: Value = serde_json::from_value(serde_json::to_value(&a).unwrap()).unwrap();
        assert_eq!(stored, a);
        assert_eq!(
            serde_json::to_value(&stored).unwrap(),
            json!({"id": 9007199254740993u64})
        );
    }
}
