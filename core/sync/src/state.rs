//! Declaration and fetch state of a sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use switchyard_common::{Error, Result};
use switchyard_transport::{Declaration, DeclarationAck, RulesQuery, SettingRecord};

/// Declaration status of a single setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeclarationStatus {
    /// Not yet declared, or declared with different attributes.
    Pending,
    /// Declared; the service view is current.
    Declared,
    /// The last declaration attempt failed.
    Failed,
}

/// The service's authoritative view of a setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerView {
    pub setting_type: String,
    pub features: Vec<String>,
    pub default_value: Option<serde_json::Value>,
    pub version: String,
}

impl From<&DeclarationAck> for ServerView {
    fn from(ack: &DeclarationAck) -> Self {
        Self {
            setting_type: ack.setting_type.clone(),
            features: ack.configurable_features.clone(),
            default_value: ack.default_value.clone(),
            version: ack.version.clone(),
        }
    }
}

impl From<&SettingRecord> for ServerView {
    fn from(record: &SettingRecord) -> Self {
        Self {
            setting_type: record.setting_type.clone(),
            features: record.configurable_features.clone(),
            default_value: record.default_value.clone(),
            version: record.version.clone(),
        }
    }
}

/// Sync bookkeeping for one setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclarationEntry {
    /// Last declaration sent, or to be sent.
    pub declaration: Declaration,
    pub status: DeclarationStatus,
    /// Service view from the last ack or metadata refresh.
    pub server: Option<ServerView>,
    pub last_declared: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    /// Service type last reported as diverging from the local type.
    pub reported_type: Option<String>,
    /// Service features last reported as diverging from the local features.
    pub reported_features: Option<Vec<String>>,
}

impl DeclarationEntry {
    pub fn new(declaration: Declaration) -> Self {
        Self {
            declaration,
            status: DeclarationStatus::Pending,
            server: None,
            last_declared: None,
            failure_count: 0,
            last_error: None,
            reported_type: None,
            reported_features: None,
        }
    }

    /// Whether `declaration` has to be sent to the service.
    pub fn needs_declaration(&self, declaration: &Declaration) -> bool {
        self.status != DeclarationStatus::Declared || self.declaration != *declaration
    }

    pub fn mark_declared(&mut self, declaration: Declaration, view: ServerView) {
        self.declaration = declaration;
        self.status = DeclarationStatus::Declared;
        self.server = Some(view);
        self.last_declared = Some(Utc::now());
        self.failure_count = 0;
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, declaration: Declaration, error: impl Into<String>) {
        self.declaration = declaration;
        self.status = DeclarationStatus::Failed;
        self.failure_count += 1;
        self.last_error = Some(error.into());
    }

    /// Record a fresh service view. Returns whether it changed.
    pub fn update_server(&mut self, view: ServerView) -> bool {
        let changed = self.server.as_ref() != Some(&view);
        self.server = Some(view);
        changed
    }
}

/// Overall sync state of an engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    entries: BTreeMap<String, DeclarationEntry>,
    /// ETag of the last rule response.
    pub etag: Option<String>,
    /// Query that produced `etag`.
    #[serde(skip)]
    pub last_query: Option<RulesQuery>,
    pub last_cycle: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub cycle_in_progress: bool,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&DeclarationEntry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DeclarationEntry> {
        self.entries.get_mut(name)
    }

    /// Entry for a setting, created pending if absent.
    pub fn entry(&mut self, declaration: &Declaration) -> &mut DeclarationEntry {
        self.entries
            .entry(declaration.name.clone())
            .or_insert_with(|| DeclarationEntry::new(declaration.clone()))
    }

    pub fn remove(&mut self, name: &str) -> Option<DeclarationEntry> {
        self.entries.remove(name)
    }

    /// Drop entries whose name does not satisfy `keep`.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.entries.retain(|name, _| keep(name));
    }

    pub fn entries(&self) -> impl Iterator<Item = &DeclarationEntry> {
        self.entries.values()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut DeclarationEntry> {
        self.entries.values_mut()
    }

    /// Names of declared settings, in name order.
    pub fn declared(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.status == DeclarationStatus::Declared)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn count_by_status(&self) -> HashMap<DeclarationStatus, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }

    /// Forget the cached rule response.
    pub fn invalidate_etag(&mut self) {
        self.etag = None;
        self.last_query = None;
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}
