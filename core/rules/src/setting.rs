//! Settings: typed, context-resolved configuration values.

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use switchyard_common::{Context, Error, Features, Result, Version};
use switchyard_schema::{FromValue, SettingType, Value};

use crate::context::ContextDefaults;
use crate::rule::{Conditions, Rule};
use crate::store::{merge_context, RuleStore};

/// Post-processing step applied to every resolved value.
///
/// Receives the value, the rule it came from (`None` for defaults) and the
/// setting. May return a replacement or reject the lookup with an error.
pub type Validator = Arc<dyn Fn(Value, Option<&Rule>, &Setting) -> Result<Value> + Send + Sync>;

/// A lossy conversion of a server value, offered to the coercion hook.
pub struct CoercionEvent<'a> {
    /// Value after coercion.
    pub value: Value,
    /// Value as received.
    pub raw: &'a serde_json::Value,
    pub coercions: &'a [String],
    /// Conditions of the originating rule; `None` for the server default.
    pub rule: Option<&'a Conditions>,
    pub setting: &'a Setting,
}

/// Decides what to do with a coerced value: accept (possibly replaced) or
/// reject with an error.
pub type CoerceHook = Arc<dyn Fn(CoercionEvent<'_>) -> Result<Value> + Send + Sync>;

/// A declared setting.
pub struct Setting {
    name: String,
    setting_type: SettingType,
    features: Features,
    default_value: Option<Value>,
    metadata: BTreeMap<String, serde_json::Value>,
    alias: Option<String>,
    version: Version,
    on_coerce: Option<CoerceHook>,
    validators: RwLock<Vec<Validator>>,
    store: ArcSwapOption<RuleStore>,
    server_default: ArcSwapOption<Value>,
    /// Context defaults for lookups made before any store is installed.
    defaults: ArcSwapOption<ContextDefaults>,
}

impl Setting {
    /// Start building a setting.
    pub fn builder(name: impl Into<String>, setting_type: SettingType) -> SettingBuilder {
        SettingBuilder {
            name: name.into(),
            setting_type,
            features: Vec::new(),
            default_value: None,
            metadata: BTreeMap::new(),
            alias: None,
            version: Version::INITIAL,
            on_coerce: None,
            validators: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn setting_type(&self) -> &SettingType {
        &self.setting_type
    }

    /// Locally declared configurable features.
    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default_value.as_ref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Features lookups currently require.
    pub fn effective_features(&self) -> Features {
        match &*self.store.load() {
            Some(store) => store.features().clone(),
            None => self.features.clone(),
        }
    }

    /// Resolve the value for a context.
    ///
    /// # Errors
    /// - `Error::MissingContext` if a required feature has no value
    /// - `Error::NoMatch` if no rule matches and there is no default
    /// - Any error returned by a validator
    pub fn get(&self, context: &Context) -> Result<Value> {
        let store = self.store.load_full();
        let (value, rule) = match store.as_deref() {
            Some(store) => {
                let merged = store.merge_context(context)?;
                match store.resolve(&merged) {
                    Some(rule) => (rule.value.clone(), Some(rule)),
                    None => (self.fallback()?, None),
                }
            }
            None => {
                let defaults = self.defaults.load();
                merge_context(&self.name, &self.features, context, defaults.as_deref())?;
                (self.fallback()?, None)
            }
        };
        self.validate(value, rule)
    }

    /// Resolve and convert into a Rust type.
    pub fn get_as<T: FromValue>(&self, context: &Context) -> Result<T> {
        T::from_value(self.get(context)?)
    }

    fn fallback(&self) -> Result<Value> {
        if let Some(value) = self.server_default.load_full() {
            return Ok(value.as_ref().clone());
        }
        self.default_value.clone().ok_or_else(|| {
            Error::NoMatch(format!(
                "No rule matched for setting '{}' and it has no default",
                self.name
            ))
        })
    }

    fn validate(&self, mut value: Value, rule: Option<&Rule>) -> Result<Value> {
        let validators: Vec<Validator> = self.validators.read().clone();
        for validator in validators {
            value = validator(value, rule, self)?;
        }
        Ok(value)
    }

    /// Append a validator. Validators run in registration order.
    pub fn add_validator<F>(&self, validator: F)
    where
        F: Fn(Value, Option<&Rule>, &Setting) -> Result<Value> + Send + Sync + 'static,
    {
        self.validators.write().push(Arc::new(validator));
    }

    /// Convert a raw server value into this setting's type.
    ///
    /// Coercions go through the coercion hook when one is set, and are
    /// accepted otherwise.
    ///
    /// # Errors
    /// - `Error::CoercionRejected` if the value cannot be converted or the
    ///   hook rejects it
    pub fn convert_server_value(
        &self,
        raw: &serde_json::Value,
        rule: Option<&Conditions>,
    ) -> Result<(Value, Vec<String>)> {
        let conversion = self.setting_type.parse(raw)?;
        if conversion.is_exact() {
            return Ok((conversion.value, conversion.coercions));
        }
        let value = match &self.on_coerce {
            Some(hook) => hook(CoercionEvent {
                value: conversion.value,
                raw,
                coercions: &conversion.coercions,
                rule,
                setting: self,
            })?,
            None => {
                debug!(
                    "Accepting coerced value for setting '{}': {}",
                    self.name,
                    conversion.coercions.join("; ")
                );
                conversion.value
            }
        };
        Ok((value, conversion.coercions))
    }

    /// Current rule store.
    pub fn store(&self) -> Option<Arc<RuleStore>> {
        self.store.load_full()
    }

    /// Install a new rule store, returning the previous one.
    pub fn replace_store(&self, store: RuleStore) -> Option<Arc<RuleStore>> {
        let incoming = store.client_id();
        let previous = self.store.swap(Some(Arc::new(store)));
        if let (Some(old), Some(new)) = (previous.as_ref().and_then(|s| s.client_id()), incoming) {
            if old != new {
                warn!(
                    "Setting '{}' received rules from client {} after client {}; lookups use the latest",
                    self.name, new, old
                );
            }
        }
        previous
    }

    /// Put back a store returned by [`Setting::replace_store`].
    pub fn restore_store(&self, store: Option<Arc<RuleStore>>) {
        self.store.store(store);
    }

    /// Context defaults used while no rule store is installed. Installed
    /// stores carry their own.
    pub fn use_defaults(&self, defaults: Option<Arc<ContextDefaults>>) {
        self.defaults.store(defaults);
    }

    /// Last server default that passed conversion.
    pub fn server_default(&self) -> Option<Arc<Value>> {
        self.server_default.load_full()
    }

    pub fn set_server_default(&self, value: Option<Value>) {
        self.server_default.store(value.map(Arc::new));
    }
}

impl fmt::Debug for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setting")
            .field("name", &self.name)
            .field("type", &self.setting_type.wire_name())
            .field("features", &self.features)
            .field("default_value", &self.default_value)
            .field("alias", &self.alias)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Setting`].
pub struct SettingBuilder {
    name: String,
    setting_type: SettingType,
    features: Vec<String>,
    default_value: Option<Value>,
    metadata: BTreeMap<String, serde_json::Value>,
    alias: Option<String>,
    version: Version,
    on_coerce: Option<CoerceHook>,
    validators: Vec<Validator>,
}

impl SettingBuilder {
    /// Configurable features, highest priority first.
    pub fn features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn on_coerce<F>(mut self, hook: F) -> Self
    where
        F: Fn(CoercionEvent<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        self.on_coerce = Some(Arc::new(hook));
        self
    }

    /// Reject every lossy conversion.
    pub fn reject_coercions(self) -> Self {
        self.on_coerce(|event| {
            Err(Error::CoercionRejected(format!(
                "coercion not allowed for setting '{}': {}",
                event.setting.name(),
                event.coercions.join("; ")
            )))
        })
    }

    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(Value, Option<&Rule>, &Setting) -> Result<Value> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Build the setting.
    ///
    /// # Errors
    /// - Empty name, or alias equal to the name
    /// - Invalid feature list
    /// - `Error::TypeMismatch` if the default is not an instance of the type
    pub fn build(self) -> Result<Setting> {
        if self.name.is_empty() {
            return Err(Error::InvalidInput("Setting name cannot be empty".to_string()));
        }
        if self.alias.as_deref() == Some(self.name.as_str()) {
            return Err(Error::InvalidInput(format!(
                "Setting '{}' cannot alias itself",
                self.name
            )));
        }
        let features = Features::new(self.features)?;
        if let Some(default) = &self.default_value {
            if !self.setting_type.is_instance(default) {
                return Err(Error::TypeMismatch(format!(
                    "Default {} of setting '{}' is not a {}",
                    default,
                    self.name,
                    self.setting_type.wire_name()
                )));
            }
        }
        Ok(Setting {
            name: self.name,
            setting_type: self.setting_type,
            features,
            default_value: self.default_value,
            metadata: self.metadata,
            alias: self.alias,
            version: self.version,
            on_coerce: self.on_coerce,
            validators: RwLock::new(self.validators),
            store: ArcSwapOption::empty(),
            server_default: ArcSwapOption::empty(),
            defaults: ArcSwapOption::empty(),
        })
    }
}
