//! Blocking facade over [`Client`] for synchronous applications.

use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use switchyard_common::Result;
use switchyard_rules::{DefaultSource, Registry};
use switchyard_transport::Transport;

use crate::client::Client;
use crate::engine::SyncConfig;
use crate::scheduler::{CycleReport, SchedulerState, UpdateHooks};

/// Runs a [`Client`] on a private single-worker runtime.
///
/// Every method blocks the calling thread. None of them may be called from
/// inside an async context.
pub struct BlockingClient<T: Transport + ?Sized + 'static> {
    client: Client<T>,
    runtime: Runtime,
}

impl<T: Transport + ?Sized + 'static> BlockingClient<T> {
    /// Create the client and its runtime.
    ///
    /// # Errors
    /// - The runtime thread could not be started
    pub fn new(transport: Arc<T>, registry: Arc<Registry>, config: SyncConfig) -> Result<Self> {
        Ok(Self {
            client: Client::new(transport, registry, config),
            runtime: Self::runtime()?,
        })
    }

    pub fn with_hooks(
        transport: Arc<T>,
        registry: Arc<Registry>,
        config: SyncConfig,
        hooks: Arc<dyn UpdateHooks>,
    ) -> Result<Self> {
        Ok(Self {
            client: Client::with_hooks(transport, registry, config, hooks),
            runtime: Self::runtime()?,
        })
    }

    fn runtime() -> Result<Runtime> {
        Ok(Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("switchyard-sync")
            .enable_all()
            .build()?)
    }

    pub fn client(&self) -> &Client<T> {
        &self.client
    }

    pub fn track_contexts<I, S>(&self, feature: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client.track_contexts(feature, values)
    }

    pub fn track_all(&self, feature: &str) -> Result<()> {
        self.client.track_all(feature)
    }

    pub fn set_default(&self, feature: &str, source: impl Into<DefaultSource>) -> Result<()> {
        self.client.set_default(feature, source)
    }

    /// Run the first sync and start refreshing on the private runtime.
    pub fn set_as_main(&self) -> Result<CycleReport> {
        self.runtime.block_on(self.client.set_as_main())
    }

    pub fn reload(&self) -> Result<CycleReport> {
        self.runtime.block_on(self.client.reload())
    }

    pub fn ping(&self) -> Result<()> {
        self.runtime.block_on(self.client.ping())
    }

    pub fn close(&self) {
        self.runtime.block_on(self.client.close())
    }

    /// Block rule store swaps until the guard is dropped.
    ///
    /// Calling [`reload`](Self::reload) while holding the guard deadlocks.
    pub fn freeze(&self) -> OwnedMutexGuard<()> {
        self.client.modification_lock().blocking_lock_owned()
    }
}

impl<T: Transport + ?Sized + 'static> Drop for BlockingClient<T> {
    fn drop(&mut self) {
        if self.client.scheduler_state() == SchedulerState::Running {
            debug!("Closing blocking client on drop");
            self.runtime.block_on(self.client.close());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_common::Context;
    use switchyard_rules::Setting;
    use switchyard_schema::{SettingType, Value};
    use switchyard_transport::MemoryTransport;

    #[test]
    fn test_blocking_lifecycle() {
        let service = Arc::new(MemoryTransport::with_context_features(["user"]));
        let registry = Arc::new(Registry::new());
        let setting = registry
            .register(
                Setting::builder("greeting", SettingType::str())
                    .features(["user"])
                    .default_value("hello")
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let client = BlockingClient::new(
            service.clone(),
            registry,
            SyncConfig {
                context_features: vec!["user".to_string()],
                max_retries: 0,
                ..SyncConfig::default()
            },
        )
        .unwrap();
        client.track_all("user").unwrap();
        client.set_as_main().unwrap();

        service
            .add_rule("greeting", [("user", "ann")], json!("hi ann"))
            .unwrap();
        client.reload().unwrap();

        assert_eq!(
            setting.get(&Context::from([("user", "ann")])).unwrap(),
            Value::from("hi ann")
        );
        client.ping().unwrap();

        let guard = client.freeze();
        drop(guard);

        client.close();
        assert_eq!(client.client().scheduler_state(), SchedulerState::Closed);
    }
}
