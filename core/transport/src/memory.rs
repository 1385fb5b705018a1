//! In-memory configuration service for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use switchyard_common::{Error, Result, Version};

use crate::provider::{
    Declaration, DeclarationAck, RuleRecord, RulesFetch, RulesQuery, SettingRecord, Transport,
};

#[derive(Debug, Default)]
struct ServiceState {
    settings: BTreeMap<String, SettingRecord>,
    rules: BTreeMap<String, Vec<RuleRecord>>,
    context_features: Vec<String>,
    revision: u64,
    next_rule_id: u64,
}

impl ServiceState {
    fn declare(&mut self, declaration: &Declaration) -> Result<DeclarationAck> {
        let declared_version: Version = declaration.version.parse()?;
        let mut created = false;
        let mut changed = Vec::new();
        let mut incomplete = BTreeMap::new();

        match self.settings.get_mut(&declaration.name) {
            None => {
                self.settings.insert(
                    declaration.name.clone(),
                    SettingRecord {
                        configurable_features: declaration.configurable_features.clone(),
                        setting_type: declaration.setting_type.clone(),
                        default_value: declaration.default_value.clone(),
                        metadata: declaration.metadata.clone(),
                        aliases: declaration.alias.iter().cloned().collect(),
                        version: declared_version.to_string(),
                    },
                );
                self.revision += 1;
                created = true;
            }
            Some(record) => {
                let differences = differences(record, declaration);
                let server_version: Version = record.version.parse()?;
                if declared_version > server_version {
                    record.setting_type = declaration.setting_type.clone();
                    record.configurable_features = declaration.configurable_features.clone();
                    record.default_value = declaration.default_value.clone();
                    record.metadata = declaration.metadata.clone();
                    if let Some(alias) = &declaration.alias {
                        if !record.aliases.contains(alias) {
                            record.aliases.push(alias.clone());
                        }
                    }
                    record.version = declared_version.to_string();
                    self.revision += 1;
                    changed = differences.into_keys().collect();
                } else {
                    incomplete = differences;
                }
            }
        }

        let record = self
            .settings
            .get(&declaration.name)
            .ok_or_else(|| Error::NotFound(declaration.name.clone()))?;
        Ok(DeclarationAck {
            name: declaration.name.clone(),
            created,
            changed,
            incomplete,
            setting_type: record.setting_type.clone(),
            configurable_features: record.configurable_features.clone(),
            default_value: record.default_value.clone(),
            version: record.version.clone(),
        })
    }

    fn etag(&self) -> String {
        format!("\"{}\"", self.revision)
    }
}

/// Fields where the service record differs from a declaration, with the
/// service's values.
fn differences(
    record: &SettingRecord,
    declaration: &Declaration,
) -> BTreeMap<String, serde_json::Value> {
    let mut out = BTreeMap::new();
    if record.setting_type != declaration.setting_type {
        out.insert("type".to_string(), record.setting_type.clone().into());
    }
    if record.configurable_features != declaration.configurable_features {
        out.insert(
            "configurable_features".to_string(),
            record.configurable_features.clone().into(),
        );
    }
    if record.default_value != declaration.default_value {
        out.insert(
            "default_value".to_string(),
            record.default_value.clone().unwrap_or(serde_json::Value::Null),
        );
    }
    if record.metadata != declaration.metadata {
        out.insert(
            "metadata".to_string(),
            serde_json::Value::Object(record.metadata.clone().into_iter().collect()),
        );
    }
    if let Some(alias) = &declaration.alias {
        if !record.aliases.contains(alias) {
            out.insert("alias".to_string(), record.aliases.clone().into());
        }
    }
    out
}

/// In-memory configuration service.
///
/// Behaves like the real service for declarations and rule queries, and
/// exposes controls for tests: editing rules and settings directly,
/// injecting latency, and making the service unreachable.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<ServiceState>,
    unreachable: AtomicBool,
    dropped: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    declare_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MemoryTransport {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a service that knows the given context features.
    pub fn with_context_features<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let transport = Self::new();
        transport.set_context_features(features);
        transport
    }

    pub fn set_context_features<I, S>(&self, features: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().context_features = features.into_iter().map(Into::into).collect();
    }

    /// Add a rule to a declared setting.
    ///
    /// # Errors
    /// - Setting not declared
    /// - A condition addresses a feature the setting is not configurable by
    pub fn add_rule<I, K, V>(
        &self,
        setting: &str,
        conditions: I,
        value: serde_json::Value,
    ) -> Result<u64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let conditions: BTreeMap<String, String> = conditions
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut state = self.state.lock();
        let record = state
            .settings
            .get(setting)
            .ok_or_else(|| Error::NotFound(format!("Setting '{}' is not declared", setting)))?;
        if let Some(feature) = conditions
            .keys()
            .find(|f| !record.configurable_features.contains(f))
        {
            return Err(Error::InvalidInput(format!(
                "Setting '{}' is not configurable by '{}'",
                setting, feature
            )));
        }

        state.next_rule_id += 1;
        let rule_id = state.next_rule_id;
        state
            .rules
            .entry(setting.to_string())
            .or_default()
            .push(RuleRecord {
                rule_id,
                conditions,
                value,
            });
        state.revision += 1;
        Ok(rule_id)
    }

    /// Delete a rule by id.
    pub fn remove_rule(&self, rule_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        let mut found = false;
        for rules in state.rules.values_mut() {
            let before = rules.len();
            rules.retain(|r| r.rule_id != rule_id);
            found |= rules.len() != before;
        }
        if !found {
            return Err(Error::NotFound(format!("Rule {} does not exist", rule_id)));
        }
        state.revision += 1;
        Ok(())
    }

    /// Edit a setting record in place, bypassing declaration rules.
    pub fn update_setting<F>(&self, name: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut SettingRecord),
    {
        let mut state = self.state.lock();
        let record = state
            .settings
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Setting '{}' is not declared", name)))?;
        edit(record);
        state.revision += 1;
        Ok(())
    }

    /// Delete a setting and its rules.
    pub fn remove_setting(&self, name: &str) -> Option<SettingRecord> {
        let mut state = self.state.lock();
        state.rules.remove(name);
        let removed = state.settings.remove(name);
        if removed.is_some() {
            state.revision += 1;
        }
        removed
    }

    pub fn setting(&self, name: &str) -> Option<SettingRecord> {
        self.state.lock().settings.get(name).cloned()
    }

    /// Monotonic counter bumped on every change.
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Make every call fail with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `calls` calls with a transport error, then recover.
    pub fn fail_next(&self, calls: usize) {
        self.dropped.store(calls, Ordering::SeqCst);
    }

    /// Delay every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn declare_calls(&self) -> usize {
        self.declare_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Transport("memory service is unreachable".to_string()));
        }
        let dropped = self
            .dropped
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return Err(Error::Transport("memory service dropped the request".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn declare(&self, declarations: &[Declaration]) -> Result<Vec<DeclarationAck>> {
        self.enter().await?;
        self.declare_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        declarations.iter().map(|d| state.declare(d)).collect()
    }

    async fn fetch_rules(&self, query: &RulesQuery) -> Result<RulesFetch> {
        self.enter().await?;
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let etag = state.etag();
        if query.etag.as_deref() == Some(etag.as_str()) {
            return Ok(RulesFetch::NotModified);
        }

        let mut rules = BTreeMap::new();
        for name in &query.settings {
            if !state.settings.contains_key(name) {
                debug!("Skipping unknown setting '{}' in rule query", name);
                continue;
            }
            let served: Vec<RuleRecord> = state
                .rules
                .get(name)
                .map(|all| {
                    all.iter()
                        .filter(|r| query.context_filters.allows(&r.conditions))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            rules.insert(name.clone(), served);
        }
        Ok(RulesFetch::Modified {
            rules,
            etag: Some(etag),
        })
    }

    async fn fetch_settings(&self) -> Result<BTreeMap<String, SettingRecord>> {
        self.enter().await?;
        Ok(self.state.lock().settings.clone())
    }

    async fn context_features(&self) -> Result<Vec<String>> {
        self.enter().await?;
        Ok(self.state.lock().context_features.clone())
    }

    async fn ping(&self) -> Result<()> {
        self.enter().await
    }
}
