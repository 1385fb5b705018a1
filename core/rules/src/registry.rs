//! Registry of declared settings.

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use switchyard_common::{Error, Result};

use crate::context::ContextDefaults;
use crate::setting::Setting;

/// Owns the settings a client declares and keeps current.
#[derive(Debug, Default)]
pub struct Registry {
    settings: RwLock<BTreeMap<String, Arc<Setting>>>,
    defaults: ArcSwapOption<ContextDefaults>,
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a setting.
    ///
    /// # Preconditions
    /// - The setting name must be unique within the registry
    ///
    /// # Postconditions
    /// - The setting is declared on the next sync cycle
    ///
    /// # Errors
    /// - Returns error if the name is already registered
    pub fn register(&self, setting: Setting) -> Result<Arc<Setting>> {
        let mut settings = self.settings.write();
        if settings.contains_key(setting.name()) {
            return Err(Error::AlreadyExists(format!(
                "Setting '{}' is already registered",
                setting.name()
            )));
        }
        setting.use_defaults(self.defaults.load_full());
        let setting = Arc::new(setting);
        settings.insert(setting.name().to_string(), setting.clone());
        Ok(setting)
    }

    /// Hand context defaults to every setting, current and future, for
    /// lookups made before its first rule store arrives.
    pub fn use_defaults(&self, defaults: Arc<ContextDefaults>) {
        let settings = self.settings.read();
        self.defaults.store(Some(defaults.clone()));
        for setting in settings.values() {
            setting.use_defaults(Some(defaults.clone()));
        }
    }

    /// Remove a setting. Existing handles keep their last store.
    ///
    /// # Errors
    /// - Returns error if the setting is not registered
    pub fn unregister(&self, name: &str) -> Result<Arc<Setting>> {
        self.settings
            .write()
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("Setting '{}' is not registered", name)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Setting>> {
        self.settings.read().get(name).cloned()
    }

    /// Snapshot of all registered settings, ordered by name.
    pub fn settings(&self) -> Vec<Arc<Setting>> {
        self.settings.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.settings.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.settings.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.settings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.read().is_empty()
    }
}
