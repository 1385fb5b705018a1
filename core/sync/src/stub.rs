//! Test double that lets tests pin setting values without a service.

use std::sync::Arc;
use tracing::warn;

use switchyard_common::{Features, Result};
use switchyard_rules::{Conditions, ContextDefaults, DefaultSource, Rule, RuleSource, RuleStore, Setting};
use switchyard_schema::Value;

/// A rule installed by a patch.
#[derive(Debug, Clone, PartialEq)]
pub struct StubRule {
    pub conditions: Conditions,
    pub value: Value,
}

impl StubRule {
    pub fn new<I, K, V>(conditions: I, value: impl Into<Value>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            conditions: conditions
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            value: value.into(),
        }
    }
}

/// What a patch installs.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// One value for every context.
    Value(Value),
    /// Rules matched over the setting's own features.
    Rules(Vec<StubRule>),
}

impl From<Value> for Patch {
    fn from(value: Value) -> Self {
        Patch::Value(value)
    }
}

impl From<Vec<StubRule>> for Patch {
    fn from(rules: Vec<StubRule>) -> Self {
        Patch::Rules(rules)
    }
}

/// Client stand-in for tests. Never talks to a service and never fails.
#[derive(Debug, Default)]
pub struct StubClient {
    defaults: Arc<ContextDefaults>,
}

impl StubClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context defaults used by rule patches.
    pub fn set_default(&self, feature: &str, source: impl Into<DefaultSource>) -> Result<()> {
        self.defaults.set(feature, source)
    }

    /// Replace the rules of a setting until the returned guard is dropped.
    ///
    /// Nested patches must be dropped in reverse order.
    pub fn patch(&self, setting: &Arc<Setting>, patch: impl Into<Patch>) -> PatchGuard {
        let store = match patch.into() {
            Patch::Value(value) => {
                if !setting.setting_type().is_instance(&value) {
                    warn!(
                        "Patching setting '{}' with {}, which is not a {}",
                        setting.name(),
                        value,
                        setting.setting_type()
                    );
                }
                let rule = Rule::new(Conditions::new(), value.to_json(), value, RuleSource::Patched);
                RuleStore::new(setting.name(), Features::empty(), vec![rule])
            }
            Patch::Rules(rules) => {
                let rules = rules
                    .into_iter()
                    .map(|r| Rule::new(r.conditions, r.value.to_json(), r.value, RuleSource::Patched))
                    .collect();
                RuleStore::new(setting.name(), setting.features().clone(), rules)
                    .with_defaults(self.defaults.clone())
            }
        };

        let previous = setting.replace_store(store);
        PatchGuard {
            setting: setting.clone(),
            previous: Some(previous),
        }
    }

    pub async fn reload(&self) -> Result<()> {
        Ok(())
    }

    pub async fn close(&self) {}

    pub async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Restores a setting's previous rules on drop.
#[must_use = "dropping the guard immediately undoes the patch"]
pub struct PatchGuard {
    setting: Arc<Setting>,
    previous: Option<Option<Arc<RuleStore>>>,
}

impl PatchGuard {
    /// Keep the patch in place permanently.
    pub fn keep(mut self) {
        self.previous = None;
    }
}

impl Drop for PatchGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.setting.restore_store(previous);
        }
    }
}
