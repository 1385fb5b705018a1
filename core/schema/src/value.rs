//! Resolved setting values and their JSON wire form.

use std::collections::BTreeMap;
use std::fmt;

/// A value held by a setting, already converted into its declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Set flag names, in the member order of the flags type.
    Flags(Vec<String>),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
}

impl Value {
    /// Build a flags value from names.
    pub fn flags<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Flags(names.into_iter().map(Into::into).collect())
    }

    /// Canonical JSON encoding.
    ///
    /// Non-finite floats have no JSON form and encode as `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Flags(names) => serde_json::Value::Array(
                names
                    .iter()
                    .map(|n| serde_json::Value::String(n.clone()))
                    .collect(),
            ),
            Value::Sequence(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Mapping(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Whether this is a primitive (usable as an enum member).
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
        )
    }

    /// Equality for enum membership: numbers compare by value, so `1` and
    /// `1.0` are the same member.
    pub fn same_member(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => *i as f64 == *f,
            _ => self == other,
        }
    }

    /// Short kind name, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Flags(_) => "flags",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value as a float. Integers convert, since `float` settings
    /// keep integral numbers as `Int`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Whether a flag is set. Always false for non-flag values.
    pub fn has_flag(&self, name: &str) -> bool {
        match self {
            Value::Flags(names) => names.iter().any(|n| n == name),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Sequence(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(entries: BTreeMap<String, T>) -> Self {
        Value::Mapping(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitive_json() {
        assert_eq!(Value::from(30).to_json(), json!(30));
        assert_eq!(Value::from(2.5).to_json(), json!(2.5));
        assert_eq!(Value::from("x").to_json(), json!("x"));
        assert_eq!(Value::from(true).to_json(), json!(true));
        assert_eq!(Value::Float(f64::NAN).to_json(), json!(null));
    }

    #[test]
    fn test_nested_json() {
        let mut entries = BTreeMap::new();
        entries.insert("fg".to_string(), vec![1, 2]);
        let value = Value::from(entries);
        assert_eq!(value.to_json(), json!({"fg": [1, 2]}));
        assert_eq!(value.kind(), "mapping");
    }

    #[test]
    fn test_same_member() {
        assert!(Value::Int(1).same_member(&Value::Float(1.0)));
        assert!(Value::Float(1.0).same_member(&Value::Int(1)));
        assert!(!Value::Int(1).same_member(&Value::Float(1.5)));
        assert!(!Value::Int(1).same_member(&Value::from("1")));
        assert_eq!(Value::Int(3).as_float(), Some(3.0));
    }

    #[test]
    fn test_flags() {
        let value = Value::flags(["A", "B"]);
        assert!(value.has_flag("A"));
        assert!(!value.has_flag("C"));
        assert_eq!(value.to_json(), json!(["A", "B"]));
        assert!(!value.is_primitive());
    }
}
