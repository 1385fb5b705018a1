//! Common types used throughout Switchyard.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Maximum number of configurable features a setting may have.
///
/// Rule scores are computed as a 64-bit mask over the feature order.
pub const MAX_FEATURES: usize = 64;

/// An ordered set of configurable feature names.
///
/// Order defines match priority: the first feature outranks every
/// combination of later ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Features(Vec<String>);

impl Features {
    /// Create a feature set from names.
    ///
    /// # Preconditions
    /// - Names must be non-empty and unique
    /// - At most [`MAX_FEATURES`] names
    ///
    /// # Errors
    /// - Returns error if any name is empty, duplicated, or the set is too large
    pub fn new<I, S>(names: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut features: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if name.is_empty() {
                return Err(crate::Error::InvalidInput(
                    "Feature name cannot be empty".to_string(),
                ));
            }
            if features.contains(&name) {
                return Err(crate::Error::InvalidInput(format!(
                    "Duplicate feature '{}'",
                    name
                )));
            }
            features.push(name);
        }
        if features.len() > MAX_FEATURES {
            return Err(crate::Error::InvalidInput(format!(
                "At most {} configurable features are supported, got {}",
                MAX_FEATURES,
                features.len()
            )));
        }
        Ok(Self(features))
    }

    /// Create an empty feature set.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Position of a feature, 0 being the highest priority.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|f| f == name)
    }

    /// Check whether a feature is part of the set.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Priority weight of a feature: `2^(F-1-i)` for position `i`.
    pub fn weight(&self, name: &str) -> Option<u64> {
        self.position(name)
            .map(|i| 1u64 << (self.0.len() - 1 - i))
    }

    /// Whether every feature here is also in `other` and `other` has more.
    pub fn is_strict_subset_of(&self, other: &Features) -> bool {
        self.0.len() < other.0.len() && self.0.iter().all(|f| other.contains(f))
    }

    /// Features of `self` that also appear in `other`, in `self` order.
    pub fn intersect(&self, other: &Features) -> Features {
        Self(self.0.iter().filter(|f| other.contains(f)).cloned().collect())
    }

    /// Features of `self` missing from `other`.
    pub fn difference(&self, other: &Features) -> Vec<String> {
        self.0.iter().filter(|f| !other.contains(f)).cloned().collect()
    }

    /// Iterate in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }

    /// Get the feature names.
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Context supplied to a lookup: feature name to value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context(BTreeMap<String, String>);

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, feature: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(feature, value);
        self
    }

    /// Set the value of a feature, replacing any previous one.
    pub fn insert(&mut self, feature: impl Into<String>, value: impl Into<String>) {
        self.0.insert(feature.into(), value.into());
    }

    pub fn get(&self, feature: &str) -> Option<&str> {
        self.0.get(feature).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Context {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Context {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// Declared version of a setting, `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    /// Version assigned to settings that do not declare one.
    pub const INITIAL: Self = Self { major: 1, minor: 0 };
}

impl Default for Version {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl FromStr for Version {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let invalid = || crate::Error::InvalidInput(format!("Invalid version '{}'", s));
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
