//! Context-scoped override rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use switchyard_common::Context;
use switchyard_schema::Value;

/// Exact-match conditions of a rule: feature name to required value.
///
/// Features not listed are wildcards.
pub type Conditions = BTreeMap<String, String>;

/// Where a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleSource {
    /// Fetched from the configuration service.
    Server { rule_id: Option<u64> },
    /// Installed locally by a test double.
    Patched,
}

/// An immutable override rule with its value already converted.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub conditions: Conditions,
    /// Value as received, before conversion.
    pub raw: serde_json::Value,
    pub value: Value,
    pub source: RuleSource,
}

impl Rule {
    pub fn new(
        conditions: Conditions,
        raw: serde_json::Value,
        value: Value,
        source: RuleSource,
    ) -> Self {
        Self {
            conditions,
            raw,
            value,
            source,
        }
    }

    /// Rule id assigned by the service, if any.
    pub fn rule_id(&self) -> Option<u64> {
        match self.source {
            RuleSource::Server { rule_id } => rule_id,
            RuleSource::Patched => None,
        }
    }

    /// Whether every condition equals the context value for that feature.
    pub fn matches(&self, context: &Context) -> bool {
        self.conditions
            .iter()
            .all(|(feature, value)| context.get(feature) == Some(value.as_str()))
    }
}
