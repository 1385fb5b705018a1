//! Setting types: the closed set of value domains a setting can declare.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use switchyard_common::{Error, Result};

use crate::value::Value;

/// Primitive value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Int,
    Float,
    Str,
    Bool,
}

impl Primitive {
    /// Wire name of the primitive.
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Int => "int",
            Primitive::Float => "float",
            Primitive::Str => "str",
            Primitive::Bool => "bool",
        }
    }

    /// Exact-kind conversion. `float` takes any JSON number; integral ones
    /// stay `Value::Int` so they format back unchanged.
    fn parse(&self, raw: &serde_json::Value) -> Option<Value> {
        match self {
            Primitive::Int => raw.as_i64().map(Value::Int),
            Primitive::Float => raw
                .as_i64()
                .map(Value::Int)
                .or_else(|| raw.as_f64().map(Value::Float)),
            Primitive::Str => raw.as_str().map(|s| Value::Str(s.to_string())),
            Primitive::Bool => raw.as_bool().map(Value::Bool),
        }
    }

    fn is_instance(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Primitive::Int, Value::Int(_))
                | (Primitive::Float, Value::Float(_) | Value::Int(_))
                | (Primitive::Str, Value::Str(_))
                | (Primitive::Bool, Value::Bool(_))
        )
    }
}

/// Result of parsing a raw value: the converted value and every lossy step
/// taken to get there.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub value: Value,
    pub coercions: Vec<String>,
}

impl Conversion {
    /// A conversion without coercions.
    pub fn exact(value: Value) -> Self {
        Self {
            value,
            coercions: Vec::new(),
        }
    }

    /// Whether the raw value converted without loss.
    pub fn is_exact(&self) -> bool {
        self.coercions.is_empty()
    }
}

/// Value domain of a setting.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingType {
    Primitive(Primitive),
    /// Ordered set of primitive members.
    Enum(Vec<Value>),
    /// Ordered set of flag names.
    Flags(Vec<String>),
    Sequence(Box<SettingType>),
    /// Mapping with string keys.
    Mapping(Box<SettingType>),
}

impl SettingType {
    pub fn int() -> Self {
        SettingType::Primitive(Primitive::Int)
    }

    pub fn float() -> Self {
        SettingType::Primitive(Primitive::Float)
    }

    pub fn str() -> Self {
        SettingType::Primitive(Primitive::Str)
    }

    pub fn bool() -> Self {
        SettingType::Primitive(Primitive::Bool)
    }

    /// Create an enum type.
    ///
    /// # Preconditions
    /// - At least one member
    /// - Members are finite primitives and pairwise distinct
    ///
    /// # Errors
    /// - Returns error if any precondition fails
    pub fn enumeration<I, V>(members: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut unique: Vec<Value> = Vec::new();
        for member in members {
            let member = member.into();
            if !member.is_primitive() {
                return Err(Error::InvalidInput(format!(
                    "Enum member {} is not a primitive",
                    member
                )));
            }
            if matches!(member, Value::Float(f) if !f.is_finite()) {
                return Err(Error::InvalidInput(
                    "Enum members must be finite".to_string(),
                ));
            }
            if unique.iter().any(|m| m.same_member(&member)) {
                return Err(Error::InvalidInput(format!(
                    "Duplicate enum member {}",
                    member
                )));
            }
            unique.push(member);
        }
        if unique.is_empty() {
            return Err(Error::InvalidInput(
                "Enum type needs at least one member".to_string(),
            ));
        }
        Ok(SettingType::Enum(unique))
    }

    /// Create a flags type.
    ///
    /// # Errors
    /// - Returns error on empty or duplicate names
    pub fn flags<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if name.is_empty() {
                return Err(Error::InvalidInput("Flag name cannot be empty".to_string()));
            }
            if unique.contains(&name) {
                return Err(Error::InvalidInput(format!("Duplicate flag '{}'", name)));
            }
            unique.push(name);
        }
        Ok(SettingType::Flags(unique))
    }

    pub fn sequence(inner: SettingType) -> Self {
        SettingType::Sequence(Box::new(inner))
    }

    pub fn mapping(inner: SettingType) -> Self {
        SettingType::Mapping(Box::new(inner))
    }

    /// Canonical wire name, e.g. `Sequence<Enum["blue","red"]>`.
    ///
    /// Enum and flag members are listed by their sorted JSON text, so member
    /// order does not affect the name.
    pub fn wire_name(&self) -> String {
        match self {
            SettingType::Primitive(p) => p.name().to_string(),
            SettingType::Enum(members) => {
                let mut parts: Vec<String> =
                    members.iter().map(|m| m.to_json().to_string()).collect();
                parts.sort();
                format!("Enum[{}]", parts.join(","))
            }
            SettingType::Flags(names) => {
                let mut parts: Vec<String> = names
                    .iter()
                    .map(|n| serde_json::Value::String(n.clone()).to_string())
                    .collect();
                parts.sort();
                format!("Flags[{}]", parts.join(","))
            }
            SettingType::Sequence(inner) => format!("Sequence<{}>", inner.wire_name()),
            SettingType::Mapping(inner) => format!("Mapping<{}>", inner.wire_name()),
        }
    }

    /// Parse a raw JSON value into this type.
    ///
    /// Flags drop unknown names; sequences and mappings drop elements that
    /// fail to convert. Each drop is recorded as a coercion. Anything else
    /// that does not fit is rejected.
    ///
    /// # Errors
    /// - `Error::CoercionRejected` when no value of this type can be salvaged
    pub fn parse(&self, raw: &serde_json::Value) -> Result<Conversion> {
        match self {
            SettingType::Primitive(p) => p.parse(raw).map(Conversion::exact).ok_or_else(|| {
                Error::CoercionRejected(format!("{} is not of type {}", raw, p.name()))
            }),
            SettingType::Enum(members) => primitive_from_json(raw)
                .ok()
                .filter(|value| members.iter().any(|m| m.same_member(value)))
                .map(Conversion::exact)
                .ok_or_else(|| {
                    Error::CoercionRejected(format!(
                        "{} is not a member of {}",
                        raw,
                        self.wire_name()
                    ))
                }),
            SettingType::Flags(names) => {
                let items = raw.as_array().ok_or_else(|| {
                    Error::CoercionRejected(format!("expected an array of flags, got {}", raw))
                })?;
                let mut selected: HashSet<&str> = HashSet::new();
                let mut coercions = Vec::new();
                for item in items {
                    let name = item.as_str().ok_or_else(|| {
                        Error::CoercionRejected(format!("expected string in flags, got {}", item))
                    })?;
                    if names.iter().any(|n| n == name) {
                        selected.insert(name);
                    } else {
                        coercions.push(format!("unrecognized flag '{}'", name));
                    }
                }
                let value = names
                    .iter()
                    .filter(|n| selected.contains(n.as_str()))
                    .cloned()
                    .collect();
                Ok(Conversion {
                    value: Value::Flags(value),
                    coercions,
                })
            }
            SettingType::Sequence(inner) => {
                let items = raw.as_array().ok_or_else(|| {
                    Error::CoercionRejected(format!("expected an array, got {}", raw))
                })?;
                let mut values = Vec::with_capacity(items.len());
                let mut coercions = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    match inner.parse(item) {
                        Ok(conversion) => {
                            values.push(conversion.value);
                            coercions.extend(
                                conversion
                                    .coercions
                                    .into_iter()
                                    .map(|c| format!("element {}: {}", i, c)),
                            );
                        }
                        Err(e) => coercions.push(format!(
                            "failed to convert element {}: {}",
                            i,
                            rejection_reason(&e)
                        )),
                    }
                }
                Ok(Conversion {
                    value: Value::Sequence(values),
                    coercions,
                })
            }
            SettingType::Mapping(inner) => {
                let entries = raw.as_object().ok_or_else(|| {
                    Error::CoercionRejected(format!("expected an object, got {}", raw))
                })?;
                let mut values = BTreeMap::new();
                let mut coercions = Vec::new();
                for (key, item) in entries {
                    match inner.parse(item) {
                        Ok(conversion) => {
                            values.insert(key.clone(), conversion.value);
                            coercions.extend(
                                conversion
                                    .coercions
                                    .into_iter()
                                    .map(|c| format!("{}: {}", key, c)),
                            );
                        }
                        Err(e) => coercions.push(format!(
                            "failed to convert value for key {}: {}",
                            key,
                            rejection_reason(&e)
                        )),
                    }
                }
                Ok(Conversion {
                    value: Value::Mapping(values),
                    coercions,
                })
            }
        }
    }

    /// Encode a value of this type for the wire. The value must be an
    /// instance of this type.
    pub fn format(&self, value: &Value) -> serde_json::Value {
        value.to_json()
    }

    /// Whether a value belongs to this type.
    pub fn is_instance(&self, value: &Value) -> bool {
        match (self, value) {
            (SettingType::Primitive(p), v) => p.is_instance(v),
            (SettingType::Enum(members), v) => members.iter().any(|m| m.same_member(v)),
            (SettingType::Flags(names), Value::Flags(set)) => {
                // Set flags must follow member order without repeats.
                let mut remaining = names.iter();
                set.iter().all(|flag| remaining.any(|n| n == flag))
            }
            (SettingType::Sequence(inner), Value::Sequence(items)) => {
                items.iter().all(|item| inner.is_instance(item))
            }
            (SettingType::Mapping(inner), Value::Mapping(entries)) => {
                entries.values().all(|item| inner.is_instance(item))
            }
            _ => false,
        }
    }
}

impl fmt::Display for SettingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

impl FromStr for SettingType {
    type Err = Error;

    /// Parse a wire name back into a type.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "int" => return Ok(SettingType::int()),
            "float" => return Ok(SettingType::float()),
            "str" => return Ok(SettingType::str()),
            "bool" => return Ok(SettingType::bool()),
            _ => {}
        }
        if let Some(inner) = s.strip_prefix("Sequence<").and_then(|r| r.strip_suffix('>')) {
            return Ok(SettingType::sequence(inner.parse()?));
        }
        if let Some(inner) = s.strip_prefix("Mapping<").and_then(|r| r.strip_suffix('>')) {
            return Ok(SettingType::mapping(inner.parse()?));
        }
        if let Some(inner) = s.strip_prefix("Enum[").and_then(|r| r.strip_suffix(']')) {
            let members: Vec<serde_json::Value> = serde_json::from_str(&format!("[{}]", inner))?;
            let members = members
                .iter()
                .map(primitive_from_json)
                .collect::<Result<Vec<_>>>()?;
            return SettingType::enumeration(members);
        }
        if let Some(inner) = s.strip_prefix("Flags[").and_then(|r| r.strip_suffix(']')) {
            let names: Vec<String> = serde_json::from_str(&format!("[{}]", inner))?;
            return SettingType::flags(names);
        }
        Err(Error::InvalidInput(format!("Unknown setting type '{}'", s)))
    }
}

fn primitive_from_json(raw: &serde_json::Value) -> Result<Value> {
    match raw {
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::Int(i)),
            None => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| Error::InvalidInput(format!("Unsupported number {}", n))),
        },
        other => Err(Error::InvalidInput(format!(
            "Enum member {} is not a primitive",
            other
        ))),
    }
}

fn rejection_reason(err: &Error) -> String {
    match err {
        Error::CoercionRejected(reason) => reason.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn colors() -> SettingType {
        SettingType::enumeration(["red", "blue", "green"]).unwrap()
    }

    #[test]
    fn test_enum_wire_name_and_parse() {
        let t = SettingType::enumeration(vec![
            Value::Int(0),
            Value::Int(1),
            Value::from("c"),
            Value::Float(3.5),
        ])
        .unwrap();
        assert_eq!(t.wire_name(), r#"Enum["c",0,1,3.5]"#);
        assert_eq!(t.parse(&json!(0)).unwrap(), Conversion::exact(Value::Int(0)));
        assert_eq!(t.parse(&json!("c")).unwrap(), Conversion::exact(Value::from("c")));
        assert!(matches!(t.parse(&json!("b")), Err(Error::CoercionRejected(_))));
    }

    #[test]
    fn test_enum_numbers_match_by_value() {
        let floats = SettingType::enumeration(vec![Value::Float(1.0), Value::Float(2.5)]).unwrap();
        let conversion = floats.parse(&json!(1)).unwrap();
        assert_eq!(conversion, Conversion::exact(Value::Int(1)));
        assert_eq!(floats.format(&conversion.value), json!(1));
        assert!(floats.is_instance(&Value::Int(1)));
        assert!(floats.parse(&json!(2)).is_err());

        let ints = SettingType::enumeration([1i64, 2]).unwrap();
        let conversion = ints.parse(&json!(1.0)).unwrap();
        assert_eq!(conversion.value, Value::Float(1.0));
        assert_eq!(ints.format(&conversion.value), json!(1.0));
        assert!(ints.parse(&json!(1.5)).is_err());

        assert!(SettingType::enumeration(vec![Value::Int(1), Value::Float(1.0)]).is_err());
    }

    #[test]
    fn test_enum_rejects_duplicates_and_composites() {
        assert!(SettingType::enumeration(["a", "a"]).is_err());
        assert!(SettingType::enumeration(vec![Value::flags(["a"])]).is_err());
        assert!(SettingType::enumeration(Vec::<Value>::new()).is_err());
    }

    #[test]
    fn test_flags_drop_unknown_members() {
        let t = SettingType::flags(["A", "B"]).unwrap();
        assert_eq!(t.wire_name(), r#"Flags["A","B"]"#);

        let conversion = t.parse(&json!(["A", "C"])).unwrap();
        assert_eq!(conversion.value, Value::flags(["A"]));
        assert_eq!(conversion.coercions, vec!["unrecognized flag 'C'".to_string()]);

        assert_eq!(t.parse(&json!([])).unwrap(), Conversion::exact(Value::flags(Vec::<String>::new())));
        assert_eq!(t.parse(&json!(["B", "A"])).unwrap().value, Value::flags(["A", "B"]));
        assert!(t.parse(&json!(["A", 1])).is_err());
    }

    #[test]
    fn test_sequence_drops_failed_elements() {
        let t = SettingType::sequence(colors());
        assert_eq!(t.wire_name(), r#"Sequence<Enum["blue","green","red"]>"#);

        let conversion = t
            .parse(&json!(["green", "red", "blue", "white", "green"]))
            .unwrap();
        assert_eq!(
            conversion.value,
            Value::from(vec!["green", "red", "blue", "green"])
        );
        assert_eq!(conversion.coercions.len(), 1);
        assert!(conversion.coercions[0].starts_with("failed to convert element 3"));
    }

    #[test]
    fn test_mapping_drops_failed_values() {
        let t = SettingType::mapping(colors());
        assert_eq!(t.wire_name(), r#"Mapping<Enum["blue","green","red"]>"#);

        let conversion = t
            .parse(&json!({"fg": "blue", "bg": "red", "tx": "white"}))
            .unwrap();
        let Value::Mapping(entries) = &conversion.value else {
            panic!("expected mapping");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["fg"], Value::from("blue"));
        assert!(conversion.coercions[0].starts_with("failed to convert value for key tx"));
    }

    #[test]
    fn test_nested_coercions_are_prefixed() {
        let t = SettingType::sequence(SettingType::flags(["A"]).unwrap());
        let conversion = t.parse(&json!([["A", "Z"]])).unwrap();
        assert_eq!(
            conversion.coercions,
            vec!["element 0: unrecognized flag 'Z'".to_string()]
        );
    }

    #[test]
    fn test_primitives_are_exact() {
        let int = SettingType::int();
        assert_eq!(int.parse(&json!(1)).unwrap().value, Value::Int(1));
        assert!(int.parse(&json!(1.5)).is_err());
        assert!(int.parse(&json!("1")).is_err());
        assert!(int.parse(&json!(true)).is_err());

        let float = SettingType::float();
        assert_eq!(float.parse(&json!(2)).unwrap().value, Value::Int(2));
        assert_eq!(float.format(&float.parse(&json!(2)).unwrap().value), json!(2));
        assert_eq!(float.parse(&json!(2.0)).unwrap().value, Value::Float(2.0));
        assert_eq!(float.format(&Value::Float(2.0)), json!(2.0));
        assert!(float.is_instance(&Value::Int(2)));
        assert!(float.parse(&json!("2")).is_err());

        assert!(SettingType::bool().parse(&json!(1)).is_err());
        assert!(SettingType::str().parse(&json!(null)).is_err());
    }

    #[test]
    fn test_wire_name_parses_back() {
        let names = [
            "int",
            "Sequence<Mapping<bool>>",
            r#"Enum["c",0,1,3.5]"#,
            r#"Flags["a","b"]"#,
            r#"Mapping<Sequence<Enum["blue","green","red"]>>"#,
        ];
        for name in names {
            let t: SettingType = name.parse().unwrap();
            assert_eq!(t.wire_name(), name);
        }
        assert!("Tuple<int>".parse::<SettingType>().is_err());
    }

    #[test]
    fn test_is_instance() {
        let flags = SettingType::flags(["A", "B", "C"]).unwrap();
        assert!(flags.is_instance(&Value::flags(["A", "C"])));
        assert!(!flags.is_instance(&Value::flags(["C", "A"])));
        assert!(!flags.is_instance(&Value::flags(["D"])));

        let seq = SettingType::sequence(SettingType::int());
        assert!(seq.is_instance(&Value::from(vec![1, 2])));
        assert!(!seq.is_instance(&Value::from(vec!["x"])));
        assert!(!SettingType::int().is_instance(&Value::Float(1.0)));
    }

    fn json_value() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            any::<f64>()
                .prop_filter("finite", |f| f.is_finite())
                .prop_map(serde_json::Value::from),
            prop::sample::select(vec![0.0, 1.0, 2.5]).prop_map(serde_json::Value::from),
            "[a-z]{0,6}".prop_map(serde_json::Value::from),
            prop::sample::select(vec!["A", "B", "C", "D"]).prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
                prop::collection::btree_map("[a-z]{1,3}", inner, 0..4)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    // Flags accept any order on input but always format in member order.
    fn contains_flags(t: &SettingType) -> bool {
        match t {
            SettingType::Flags(_) => true,
            SettingType::Sequence(inner) | SettingType::Mapping(inner) => contains_flags(inner),
            _ => false,
        }
    }

    fn setting_type() -> impl Strategy<Value = SettingType> {
        let leaf = prop_oneof![
            Just(SettingType::int()),
            Just(SettingType::float()),
            Just(SettingType::str()),
            Just(SettingType::bool()),
            Just(SettingType::flags(["A", "B"]).unwrap()),
            Just(SettingType::enumeration(["A", "C"]).unwrap()),
            Just(SettingType::enumeration(vec![Value::Int(1), Value::Float(2.5)]).unwrap()),
        ];
        leaf.prop_recursive(2, 8, 1, |inner| {
            prop_oneof![
                inner.clone().prop_map(SettingType::sequence),
                inner.prop_map(SettingType::mapping),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_coercion_is_idempotent(t in setting_type(), raw in json_value()) {
            if let Ok(first) = t.parse(&raw) {
                prop_assert!(t.is_instance(&first.value));
                let second = t.parse(&t.format(&first.value)).unwrap();
                prop_assert_eq!(&second.value, &first.value);
                prop_assert!(second.is_exact());
            }
        }

        #[test]
        fn prop_exact_values_round_trip(t in setting_type(), raw in json_value()) {
            if let Ok(conversion) = t.parse(&raw) {
                let canonical = t.format(&conversion.value);
                if conversion.is_exact() && !contains_flags(&t) {
                    prop_assert_eq!(&canonical, &raw);
                }
                prop_assert_eq!(t.format(&t.parse(&canonical).unwrap().value), canonical);
            }
        }
    }
}
