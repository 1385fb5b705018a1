//! Transport trait and wire records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use switchyard_common::{Result, TrackedContexts};

/// A setting declaration as sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    /// Wire name of the setting type.
    #[serde(rename = "type")]
    pub setting_type: String,
    pub configurable_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// `major.minor`.
    pub version: String,
}

/// The service's answer to one declaration.
///
/// Type, features and default are the service's authoritative values, which
/// may differ from what was declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclarationAck {
    pub name: String,
    pub created: bool,
    /// Fields the declaration changed on the service.
    #[serde(default)]
    pub changed: Vec<String>,
    /// Fields where the service kept a value other than the declared one.
    #[serde(default)]
    pub incomplete: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "type")]
    pub setting_type: String,
    pub configurable_features: Vec<String>,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
    pub version: String,
}

/// One rule as served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub rule_id: u64,
    /// Feature name to exact value.
    #[serde(rename = "context_features")]
    pub conditions: BTreeMap<String, String>,
    pub value: serde_json::Value,
}

/// Service-side view of a setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingRecord {
    pub configurable_features: Vec<String>,
    #[serde(rename = "type")]
    pub setting_type: String,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub version: String,
}

/// A rule query for a set of settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RulesQuery {
    pub settings: Vec<String>,
    pub context_filters: TrackedContexts,
    /// ETag of the last response to an identical query.
    pub etag: Option<String>,
}

impl RulesQuery {
    /// JSON request body.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "settings": self.settings,
            "context_filters": self.context_filters.to_wire(),
            "include_metadata": false,
        })
    }

    /// Whether two queries ask for the same rules, ignoring the ETag.
    pub fn same_request(&self, other: &RulesQuery) -> bool {
        self.settings == other.settings && self.context_filters == other.context_filters
    }
}

/// Outcome of a rule fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum RulesFetch {
    /// Nothing changed since the ETag sent with the query.
    NotModified,
    Modified {
        /// Rules per setting, in service order.
        rules: BTreeMap<String, Vec<RuleRecord>>,
        etag: Option<String>,
    },
}

/// Connection to the configuration service.
///
/// Implementations own timeouts and authentication. Failures that may
/// succeed on retry should be reported as `Error::Transport`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name, for logs.
    fn name(&self) -> &str;

    /// Declare settings.
    ///
    /// # Postconditions
    /// - One ack per declaration, in order
    /// - Repeating a declaration has no further effect
    ///
    /// # Errors
    /// - Network errors
    /// - Invalid declaration
    async fn declare(&self, declarations: &[Declaration]) -> Result<Vec<DeclarationAck>>;

    /// Fetch the rules of the queried settings that fall inside the
    /// query's context filters.
    async fn fetch_rules(&self, query: &RulesQuery) -> Result<RulesFetch>;

    /// Fetch the service's view of every setting.
    async fn fetch_settings(&self) -> Result<BTreeMap<String, SettingRecord>>;

    /// Context features known to the service, in priority order.
    async fn context_features(&self) -> Result<Vec<String>>;

    /// Health check.
    async fn ping(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_declaration_wire_shape() {
        let declaration = Declaration {
            name: "cache_size".to_string(),
            setting_type: "int".to_string(),
            configurable_features: vec!["user".to_string()],
            default_value: Some(json!(10)),
            metadata: BTreeMap::new(),
            alias: None,
            version: "1.0".to_string(),
        };
        let wire = serde_json::to_value(&declaration).unwrap();
        assert_eq!(
            wire,
            json!({
                "name": "cache_size",
                "type": "int",
                "configurable_features": ["user"],
                "default_value": 10,
                "metadata": {},
                "version": "1.0",
            })
        );
    }

    #[test]
    fn test_ack_parses_minimal_response() {
        let ack: DeclarationAck = serde_json::from_value(json!({
            "name": "a",
            "created": true,
            "type": "bool",
            "configurable_features": [],
            "version": "1.0",
        }))
        .unwrap();
        assert!(ack.changed.is_empty());
        assert!(ack.incomplete.is_empty());
        assert_eq!(ack.default_value, None);
    }

    #[test]
    fn test_query_body() {
        let mut filters = TrackedContexts::new();
        filters.track("user", ["ann"]).unwrap();
        filters.track_all("theme").unwrap();
        let query = RulesQuery {
            settings: vec!["a".to_string()],
            context_filters: filters,
            etag: Some("\"3\"".to_string()),
        };
        assert_eq!(
            query.body(),
            json!({
                "settings": ["a"],
                "context_filters": {"theme": "*", "user": ["ann"]},
                "include_metadata": false,
            })
        );
        let mut other = query.clone();
        other.etag = None;
        assert!(query.same_request(&other));
    }
}
