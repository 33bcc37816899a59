//! Dynamic attribute values.
//!
//! Attribute values are a discriminated union resolved in one explicit pass.
//! Before resolution a value may hold [`Reference`]s; during planning a value
//! may hold [`Value::Unknown`] for data only known after apply. Resolved
//! values persisted to state hold neither.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::reference::Reference;

/// Rendering of a value that will only be known after apply.
pub const UNKNOWN_MARKER: &str = "(known after apply)";

/// Attribute map, in declaration order.
pub type Attributes = IndexMap<String, Value>;

/// A typed dynamic value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Number, integral or floating point.
    Number(serde_json::Number),
    /// String.
    String(String),
    /// Ordered list.
    List(Vec<Value>),
    /// Map keyed by string, insertion ordered.
    Map(IndexMap<String, Value>),
    /// Pointer to another resource's attribute.
    Ref(Reference),
    /// Value computed by the provider, not known until apply.
    Unknown,
}

impl Value {
    /// Creates a string value.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Creates an integer value.
    #[must_use]
    pub fn int(n: i64) -> Self {
        Self::Number(n.into())
    }

    /// Creates a reference value.
    #[must_use]
    pub fn reference(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::Ref(Reference::new(resource, attribute))
    }

    /// Returns the string content if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns true if this is a null value.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true if no references or unknowns remain anywhere inside.
    #[must_use]
    pub fn is_known(&self) -> bool {
        match self {
            Self::Ref(_) | Self::Unknown => false,
            Self::List(items) => items.iter().all(Self::is_known),
            Self::Map(map) => map.values().all(Self::is_known),
            _ => true,
        }
    }

    /// Collects every reference contained in this value, depth first.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Ref(reference) => out.push(reference),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(map) => {
                for value in map.values() {
                    value.collect_references(out);
                }
            }
            _ => {}
        }
    }

    /// Looks up a nested path segment: a key for maps, an index for lists.
    #[must_use]
    pub fn get_segment(&self, segment: &str) -> Option<&Self> {
        match self {
            Self::Map(map) => map.get(segment),
            Self::List(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    /// Deep equality: maps compare regardless of key order, lists compare
    /// element-wise in order, and numbers compare by numeric value.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) | (Self::Unknown, Self::Unknown) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => numbers_equal(a, b),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }
}

fn numbers_equal(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => false,
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => {
                Reference::parse(&s).map_or(Self::String(s), Self::Ref)
            }
            serde_json::Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::List(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Map(map) => Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
            Value::Ref(reference) => Self::String(reference.to_string()),
            Value::Unknown => Self::String(UNKNOWN_MARKER.to_string()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Ref(reference) => write!(f, "{reference}"),
            Self::Unknown => write!(f, "{UNKNOWN_MARKER}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key} = {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, Value)]) -> Value {
        Value::Map(entries.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect())
    }

    #[test]
    fn test_map_equality_ignores_order() {
        let a = map(&[("cidr", "10.0.0.0/16".into()), ("dns", true.into())]);
        let b = map(&[("dns", true.into()), ("cidr", "10.0.0.0/16".into())]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_list_equality_respects_order() {
        let a = Value::List(vec!["a".into(), "b".into()]);
        let b = Value::List(vec!["b".into(), "a".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_numbers_compare_by_value() {
        let int: Value = serde_json::json!(443).into();
        let float: Value = serde_json::json!(443.0).into();
        assert_eq!(int, float);
        assert_ne!(Value::int(80), Value::int(443));
    }

    #[test]
    fn test_reference_tokens_become_refs() {
        let value: Value = serde_json::json!({"vpc_id": "${main.id}", "name": "public"}).into();
        let refs = value.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].resource, "main");
        assert!(!value.is_known());
    }

    #[test]
    fn test_yaml_roundtrip_keeps_reference() {
        let value: Value = serde_yaml::from_str("subnet: ${public_a.id}\nports: [80, 443]").unwrap();
        let yaml = serde_yaml::to_string(&value).unwrap();
        let back: Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn test_segment_lookup() {
        let value: Value = serde_json::json!({"ids": ["sg-1", "sg-2"], "by_name": {"web": "sg-9"}}).into();
        let ids = value.get_segment("ids").unwrap();
        assert_eq!(ids.get_segment("1"), Some(&Value::string("sg-2")));
        let by_name = value.get_segment("by_name").unwrap();
        assert_eq!(by_name.get_segment("web"), Some(&Value::string("sg-9")));
        assert!(ids.get_segment("7").is_none());
    }
}
