//! Client-level context defaults.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use switchyard_common::{Error, Result};

/// Supplies a context value at lookup time.
///
/// Called synchronously on every `get()` that needs the feature, so
/// implementations should be cheap.
pub trait ContextResolver: Send + Sync {
    fn resolve(&self) -> Option<String>;
}

impl<F> ContextResolver for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn resolve(&self) -> Option<String> {
        self()
    }
}

/// Default value of one context feature.
#[derive(Clone)]
pub enum DefaultSource {
    Literal(String),
    Resolver(Arc<dyn ContextResolver>),
}

impl DefaultSource {
    pub fn resolver(resolver: impl ContextResolver + 'static) -> Self {
        DefaultSource::Resolver(Arc::new(resolver))
    }

    pub fn resolve(&self) -> Option<String> {
        match self {
            DefaultSource::Literal(value) => Some(value.clone()),
            DefaultSource::Resolver(resolver) => resolver.resolve(),
        }
    }
}

impl fmt::Debug for DefaultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultSource::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            DefaultSource::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl From<&str> for DefaultSource {
    fn from(value: &str) -> Self {
        DefaultSource::Literal(value.to_string())
    }
}

impl From<String> for DefaultSource {
    fn from(value: String) -> Self {
        DefaultSource::Literal(value)
    }
}

/// Context values filled in when a lookup does not supply them.
#[derive(Debug, Default)]
pub struct ContextDefaults {
    sources: RwLock<BTreeMap<String, DefaultSource>>,
}

impl ContextDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default of a feature.
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if the feature already has a default
    pub fn set(&self, feature: impl Into<String>, source: impl Into<DefaultSource>) -> Result<()> {
        let feature = feature.into();
        let mut sources = self.sources.write();
        if sources.contains_key(&feature) {
            return Err(Error::AlreadyExists(format!(
                "Context feature '{}' already has a default",
                feature
            )));
        }
        sources.insert(feature, source.into());
        Ok(())
    }

    /// Resolve the default of a feature.
    pub fn resolve(&self, feature: &str) -> Option<String> {
        // Resolvers run outside the lock.
        let source = self.sources.read().get(feature).cloned()?;
        source.resolve()
    }

    pub fn contains(&self, feature: &str) -> bool {
        self.sources.read().contains_key(feature)
    }

    pub fn features(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_literal_and_resolver() {
        let defaults = ContextDefaults::new();
        defaults.set("env", "prod").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        defaults
            .set(
                "user",
                DefaultSource::resolver(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Some("ann".to_string())
                }),
            )
            .unwrap();

        assert_eq!(defaults.resolve("env").as_deref(), Some("prod"));
        assert_eq!(defaults.resolve("user").as_deref(), Some("ann"));
        assert_eq!(defaults.resolve("user").as_deref(), Some("ann"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(defaults.resolve("theme"), None);
    }

    #[test]
    fn test_duplicate_default_fails() {
        let defaults = ContextDefaults::new();
        defaults.set("env", "prod").unwrap();
        assert!(matches!(
            defaults.set("env", "dev"),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(defaults.resolve("env").as_deref(), Some("prod"));
    }
}
