//! Mapping between Rust types and setting types.

use std::collections::BTreeMap;

use switchyard_common::{Error, Result};

use crate::setting_type::SettingType;
use crate::value::Value;

/// A Rust type with a canonical setting type.
pub trait Typed {
    fn setting_type() -> SettingType;
}

/// Extract a Rust value from a resolved [`Value`].
pub trait FromValue: Sized {
    /// # Errors
    /// - `Error::TypeMismatch` if the value has a different shape
    fn from_value(value: Value) -> Result<Self>;
}

impl SettingType {
    /// Setting type of a Rust type.
    pub fn of<T: Typed>() -> Self {
        T::setting_type()
    }
}

fn mismatch(expected: &str, value: &Value) -> Error {
    Error::TypeMismatch(format!("expected {}, got {}", expected, value.kind()))
}

impl Typed for i64 {
    fn setting_type() -> SettingType {
        SettingType::int()
    }
}

impl Typed for f64 {
    fn setting_type() -> SettingType {
        SettingType::float()
    }
}

impl Typed for String {
    fn setting_type() -> SettingType {
        SettingType::str()
    }
}

impl Typed for bool {
    fn setting_type() -> SettingType {
        SettingType::bool()
    }
}

impl<T: Typed> Typed for Vec<T> {
    fn setting_type() -> SettingType {
        SettingType::sequence(T::setting_type())
    }
}

impl<T: Typed> Typed for BTreeMap<String, T> {
    fn setting_type() -> SettingType {
        SettingType::mapping(T::setting_type())
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        value.as_int().ok_or_else(|| mismatch("int", &value))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        value.as_float().ok_or_else(|| mismatch("float", &value))
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch("bool", &value))
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(mismatch("str", &other)),
        }
    }
}

/// Sequences convert element-wise; flags convert to their set names.
impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Sequence(items) => items.into_iter().map(T::from_value).collect(),
            Value::Flags(names) => names
                .into_iter()
                .map(|n| T::from_value(Value::Str(n)))
                .collect(),
            other => Err(mismatch("sequence", &other)),
        }
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Mapping(entries) => entries
                .into_iter()
                .map(|(k, v)| T::from_value(v).map(|v| (k, v)))
                .collect(),
            other => Err(mismatch("mapping", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_wire_names() {
        assert_eq!(SettingType::of::<i64>().wire_name(), "int");
        assert_eq!(
            SettingType::of::<Vec<BTreeMap<String, bool>>>().wire_name(),
            "Sequence<Mapping<bool>>"
        );
    }

    #[test]
    fn test_from_value() {
        assert_eq!(i64::from_value(Value::Int(3)).unwrap(), 3);
        assert_eq!(f64::from_value(Value::Int(2)).unwrap(), 2.0);
        assert!(i64::from_value(Value::Float(2.0)).is_err());
        assert_eq!(
            Vec::<String>::from_value(Value::flags(["A", "B"])).unwrap(),
            vec!["A".to_string(), "B".to_string()]
        );
        assert!(matches!(
            bool::from_value(Value::Int(1)),
            Err(Error::TypeMismatch(_))
        ));
        assert!(Vec::<i64>::from_value(Value::from(vec!["x"])).is_err());
    }
}
