//! Async client: a sync engine driven by a scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use uuid::Uuid;

use switchyard_common::{Result, TrackedContexts};
use switchyard_rules::{DefaultSource, Registry};
use switchyard_transport::{SettingRecord, Transport};

use crate::engine::{SyncConfig, SyncEngine};
use crate::scheduler::{CycleReport, NoopHooks, Scheduler, SchedulerState, UpdateHooks};
use crate::state::SyncState;

/// Client keeping a registry's settings up to date on the caller's runtime.
///
/// Configure tracking and defaults, then call [`Client::set_as_main`] to run
/// the first sync and start periodic refreshes.
pub struct Client<T: Transport + ?Sized> {
    engine: Arc<SyncEngine<T>>,
    scheduler: Scheduler,
}

impl<T: Transport + ?Sized + 'static> Client<T> {
    pub fn new(transport: Arc<T>, registry: Arc<Registry>, config: SyncConfig) -> Self {
        Self::with_hooks(transport, registry, config, Arc::new(NoopHooks))
    }

    pub fn with_hooks(
        transport: Arc<T>,
        registry: Arc<Registry>,
        config: SyncConfig,
        hooks: Arc<dyn UpdateHooks>,
    ) -> Self {
        let scheduler = Scheduler::new(config.update_interval, hooks);
        Self {
            engine: Arc::new(SyncEngine::new(transport, registry, config)),
            scheduler,
        }
    }

    /// Unique id of this client.
    pub fn id(&self) -> Uuid {
        self.engine.client_id()
    }

    pub fn engine(&self) -> &Arc<SyncEngine<T>> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.engine.registry()
    }

    /// Track specific values of a context feature.
    ///
    /// # Errors
    /// - The feature is already tracked with all values
    pub fn track_contexts<I, S>(&self, feature: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.engine.track_contexts(feature, values)
    }

    /// Track every value of a context feature.
    ///
    /// # Errors
    /// - The feature is already tracked with specific values
    pub fn track_all(&self, feature: &str) -> Result<()> {
        self.engine.track_all(feature)
    }

    pub fn tracked(&self) -> TrackedContexts {
        self.engine.tracked()
    }

    /// Set the default of a context feature, literal or resolved per lookup.
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if the feature already has a default
    pub fn set_default(&self, feature: &str, source: impl Into<DefaultSource>) -> Result<()> {
        self.engine.set_default(feature, source)
    }

    /// Run the first sync and start the scheduler on the current runtime.
    ///
    /// # Errors
    /// - `Error::SchedulerFatal` if the first sync fails
    /// - `Error::InvalidState` if already started
    pub async fn set_as_main(&self) -> Result<CycleReport> {
        self.engine.check_context_features().await;
        let engine = self.engine.clone();
        self.scheduler
            .start(&Handle::current(), move || {
                let engine = engine.clone();
                async move { engine.run_cycle().await }
            })
            .await
    }

    /// Sync now.
    pub async fn reload(&self) -> Result<CycleReport> {
        self.scheduler.reload().await
    }

    /// Stop refreshing. Stores already installed stay in place.
    pub async fn close(&self) {
        self.scheduler.close().await
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub async fn ping(&self) -> Result<()> {
        self.engine.transport().ping().await
    }

    /// The service's view of every setting.
    pub async fn fetch_settings(&self) -> Result<BTreeMap<String, SettingRecord>> {
        self.engine.transport().fetch_settings().await
    }

    /// Lock held while rule stores are swapped.
    ///
    /// Holding it across a `reload().await` deadlocks.
    pub fn modification_lock(&self) -> Arc<Mutex<()>> {
        self.engine.modification_lock()
    }

    /// Snapshot of the sync bookkeeping.
    pub async fn sync_state(&self) -> SyncState {
        self.engine.state().read().await.clone()
    }
}
