//! Tracked-context filter: the bounded feature/value space a client fetches
//! and retains rules for.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{Error, Result};

/// Wire marker for a feature tracked with every value.
pub const TRACK_ALL: &str = "*";

/// What a client tracks for one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tracked {
    /// Every value of the feature.
    All,
    /// A finite set of values.
    Values(BTreeSet<String>),
}

impl Tracked {
    /// Whether a rule condition value is covered.
    pub fn allows(&self, value: &str) -> bool {
        match self {
            Tracked::All => true,
            Tracked::Values(values) => values.contains(value),
        }
    }

    /// Wire encoding: `"*"` or an array of values.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Tracked::All => serde_json::Value::from(TRACK_ALL),
            Tracked::Values(values) => serde_json::Value::from(
                values.iter().cloned().collect::<Vec<_>>(),
            ),
        }
    }
}

/// Per-client tracking filter.
///
/// Features absent from the filter are untracked: only rules that leave them
/// as wildcards are fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedContexts {
    features: BTreeMap<String, Tracked>,
}

impl TrackedContexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track specific values of a feature. Values accumulate across calls.
    ///
    /// # Errors
    /// - The feature is already tracked with all values
    pub fn track<I, S>(&mut self, feature: impl Into<String>, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let feature = feature.into();
        let entry = self
            .features
            .entry(feature.clone())
            .or_insert_with(|| Tracked::Values(BTreeSet::new()));
        match entry {
            Tracked::All => Err(Error::InvalidInput(format!(
                "Feature '{}' is already tracked with all values",
                feature
            ))),
            Tracked::Values(existing) => {
                existing.extend(values.into_iter().map(Into::into));
                Ok(())
            }
        }
    }

    /// Track every value of a feature.
    ///
    /// # Errors
    /// - The feature is already tracked with specific values
    pub fn track_all(&mut self, feature: impl Into<String>) -> Result<()> {
        let feature = feature.into();
        match self.features.get(&feature) {
            Some(Tracked::Values(_)) => Err(Error::InvalidInput(format!(
                "Feature '{}' is already tracked with specific values",
                feature
            ))),
            _ => {
                self.features.insert(feature, Tracked::All);
                Ok(())
            }
        }
    }

    /// Whether every condition of a rule falls inside the tracked space.
    pub fn allows<'a, I>(&self, conditions: I) -> bool
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        conditions.into_iter().all(|(feature, value)| {
            self.features
                .get(feature)
                .is_some_and(|tracked| tracked.allows(value))
        })
    }

    pub fn get(&self, feature: &str) -> Option<&Tracked> {
        self.features.get(feature)
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Wire encoding of the whole filter.
    pub fn to_wire(&self) -> BTreeMap<String, serde_json::Value> {
        self.features
            .iter()
            .map(|(feature, tracked)| (feature.clone(), tracked.to_wire()))
            .collect()
    }
}
