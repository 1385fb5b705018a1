//! Sync engine: declares settings, fetches rules and swaps rule stores.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchyard_common::{Error, Result, TrackedContexts};
use switchyard_rules::{ContextDefaults, DefaultSource, Registry, Rule, RuleSource, RuleStore, Setting};
use switchyard_schema::Value;
use switchyard_transport::{
    Declaration, DeclarationAck, RuleRecord, RulesFetch, RulesQuery, SettingRecord, Transport,
};

use crate::reconcile::{reconcile_features, type_diverges, FeatureChange};
use crate::retry::{Backoff, Request, RetryPolicy};
use crate::scheduler::CycleReport;
use crate::state::{DeclarationEntry, DeclarationStatus, ServerView, SyncState};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time between the end of one cycle and the start of the next.
    pub update_interval: Duration,
    /// Context features this client works with, in priority order.
    pub context_features: Vec<String>,
    /// Retries for transient transport failures of each service call.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Retries of specific service calls, overriding `max_retries`.
    pub retry_overrides: BTreeMap<Request, u32>,
    /// Declarations per request.
    pub declare_batch_size: usize,
    /// Refresh the service's setting metadata every cycle.
    pub refresh_metadata: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(300),
            context_features: Vec::new(),
            max_retries: 2,
            retry_delay: Duration::from_millis(200),
            retry_overrides: BTreeMap::new(),
            declare_batch_size: 20,
            refresh_metadata: true,
        }
    }
}

impl SyncConfig {
    /// Backoff for every service call a cycle makes.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_overrides.iter().fold(
            RetryPolicy::new(Backoff::new(self.max_retries, self.retry_delay)),
            |policy, (request, retries)| {
                policy.with(*request, Backoff::new(*retries, self.retry_delay))
            },
        )
    }
}

/// Store and server default ready to be installed on a setting.
struct PendingUpdate {
    setting: Arc<Setting>,
    store: RuleStore,
    server_default: DefaultUpdate,
}

enum DefaultUpdate {
    Keep,
    Clear,
    Set(Value),
}

/// Keeps the settings of a registry in sync with the configuration service.
pub struct SyncEngine<T: Transport + ?Sized> {
    transport: Arc<T>,
    registry: Arc<Registry>,
    state: Arc<RwLock<SyncState>>,
    tracked: parking_lot::RwLock<TrackedContexts>,
    defaults: Arc<ContextDefaults>,
    /// Held while rule stores are swapped.
    modification_lock: Arc<Mutex<()>>,
    /// One cycle at a time.
    cycle_lock: Mutex<()>,
    retry: RetryPolicy,
    config: SyncConfig,
    client_id: Uuid,
}

impl<T: Transport + ?Sized> SyncEngine<T> {
    pub fn new(transport: Arc<T>, registry: Arc<Registry>, config: SyncConfig) -> Self {
        let defaults = Arc::new(ContextDefaults::new());
        registry.use_defaults(defaults.clone());
        Self {
            transport,
            registry,
            state: Arc::new(RwLock::new(SyncState::new())),
            tracked: parking_lot::RwLock::new(TrackedContexts::new()),
            defaults,
            modification_lock: Arc::new(Mutex::new(())),
            cycle_lock: Mutex::new(()),
            retry: config.retry_policy(),
            config,
            client_id: Uuid::new_v4(),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn defaults(&self) -> &Arc<ContextDefaults> {
        &self.defaults
    }

    pub fn state(&self) -> Arc<RwLock<SyncState>> {
        self.state.clone()
    }

    /// Lock serializing rule store swaps.
    ///
    /// Holding it blocks every cycle at its swap step.
    pub fn modification_lock(&self) -> Arc<Mutex<()>> {
        self.modification_lock.clone()
    }

    /// Snapshot of the tracked contexts.
    pub fn tracked(&self) -> TrackedContexts {
        self.tracked.read().clone()
    }

    /// Track specific values of a context feature from the next cycle on.
    pub fn track_contexts<I, S>(&self, feature: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.warn_unknown_feature(feature);
        self.tracked.write().track(feature, values)
    }

    /// Track every value of a context feature from the next cycle on.
    pub fn track_all(&self, feature: &str) -> Result<()> {
        self.warn_unknown_feature(feature);
        self.tracked.write().track_all(feature)
    }

    /// Set a client-level default for a context feature.
    pub fn set_default(&self, feature: &str, source: impl Into<DefaultSource>) -> Result<()> {
        self.warn_unknown_feature(feature);
        self.defaults.set(feature, source)
    }

    fn warn_unknown_feature(&self, feature: &str) {
        if !self.config.context_features.iter().any(|f| f == feature) {
            warn!(
                "Context feature '{}' is not one of the client's context features {:?}",
                feature, self.config.context_features
            );
        }
    }

    /// Compare the service's context features with the configured ones.
    ///
    /// Mismatches and failures are logged, never returned.
    pub async fn check_context_features(&self) {
        match self.transport.context_features().await {
            Ok(server) if server != self.config.context_features => {
                warn!(
                    "Context features differ from the service: local {:?}, service {:?}",
                    self.config.context_features, server
                );
            }
            Ok(_) => debug!("Context features match the service"),
            Err(e) => warn!("Could not query context features: {}", e),
        }
    }

    /// Run one declare and update cycle.
    ///
    /// # Errors
    /// - `Error::Transport` if the service stays unreachable after retries;
    ///   no store is replaced in that case
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        let start = Instant::now();
        let mut report = CycleReport::default();

        self.state.write().await.cycle_in_progress = true;
        let result = self.run_cycle_inner(&mut report).await;
        {
            let mut state = self.state.write().await;
            state.cycle_in_progress = false;
            if result.is_ok() {
                state.last_cycle = Some(chrono::Utc::now());
                state.cycles += 1;
            }
        }
        result?;

        report.duration = start.elapsed();
        info!(
            "Sync cycle completed in {:?}: {} declared, {} updated, {} rules, {} discarded, {} coerced, {} rejected, {} retries{}",
            report.duration,
            report.declared,
            report.updated,
            report.rules_loaded,
            report.rules_discarded,
            report.coercions,
            report.rejections,
            report.retries,
            if report.not_modified { " (not modified)" } else { "" }
        );
        Ok(report)
    }

    async fn run_cycle_inner(&self, report: &mut CycleReport) -> Result<()> {
        let mut views_changed = self.declare_pending(report).await?;
        if self.config.refresh_metadata {
            views_changed |= self.refresh_metadata(report).await?;
        }

        let query = self.build_query(views_changed).await;
        if query.settings.is_empty() {
            debug!("No declared settings, skipping rule fetch");
            return Ok(());
        }

        let fetched = self
            .retry
            .run(Request::FetchRules, &mut report.retries, || {
                self.transport.fetch_rules(&query)
            })
            .await?;
        let (rules, etag) = match fetched {
            RulesFetch::NotModified => {
                debug!("Rules not modified since last fetch");
                report.not_modified = true;
                return Ok(());
            }
            RulesFetch::Modified { rules, etag } => (rules, etag),
        };

        let (updates, failed) = self.build_updates(&query, &rules, report).await;
        {
            let _guard = self.modification_lock.lock().await;
            for update in updates {
                match update.server_default {
                    DefaultUpdate::Keep => {}
                    DefaultUpdate::Clear => update.setting.set_server_default(None),
                    DefaultUpdate::Set(value) => update.setting.set_server_default(Some(value)),
                }
                update.setting.replace_store(update.store);
                report.updated += 1;
            }
        }

        let mut state = self.state.write().await;
        if failed > 0 {
            // The ETag covers rules that were not installed.
            debug!("{} settings kept their previous rules, not reusing the ETag", failed);
            state.etag = None;
            state.last_query = None;
        } else {
            state.etag = etag;
            state.last_query = Some(RulesQuery { etag: None, ..query });
        }
        Ok(())
    }

    /// Declare every setting that is new, changed or failed before.
    ///
    /// Returns whether any service view changed.
    async fn declare_pending(&self, report: &mut CycleReport) -> Result<bool> {
        let settings = self.registry.settings();
        let pending: Vec<Declaration> = {
            let mut state = self.state.write().await;
            let registry = &self.registry;
            state.retain(|name| registry.contains(name));
            settings
                .iter()
                .map(|s| declaration_of(s))
                .filter(|d| {
                    state
                        .get(&d.name)
                        .map_or(true, |entry| entry.needs_declaration(d))
                })
                .collect()
        };
        if pending.is_empty() {
            return Ok(false);
        }

        let batch_size = self.config.declare_batch_size.max(1);
        for batch in pending.chunks(batch_size) {
            debug!("Declaring {} settings", batch.len());
            let result = self
                .retry
                .run(Request::Declare, &mut report.retries, || self.transport.declare(batch))
                .await
                .and_then(|acks| {
                    if acks.len() == batch.len() {
                        Ok(acks)
                    } else {
                        Err(Error::Transport(format!(
                            "Declared {} settings but received {} acknowledgements",
                            batch.len(),
                            acks.len()
                        )))
                    }
                });
            let acks = match result {
                Ok(acks) => acks,
                Err(e) => {
                    self.fail_batch(batch, &e).await;
                    return Err(e);
                }
            };

            let mut state = self.state.write().await;
            for (declaration, ack) in batch.iter().zip(acks.iter()) {
                log_ack(ack);
                state
                    .entry(declaration)
                    .mark_declared(declaration.clone(), ServerView::from(ack));
                report.declared += 1;
            }
        }
        Ok(true)
    }

    async fn fail_batch(&self, batch: &[Declaration], error: &Error) {
        let mut state = self.state.write().await;
        for declaration in batch {
            state
                .entry(declaration)
                .mark_failed(declaration.clone(), error.to_string());
        }
    }

    /// Pull the service's current view of every declared setting.
    ///
    /// Returns whether any view changed.
    async fn refresh_metadata(&self, report: &mut CycleReport) -> Result<bool> {
        if self.state.read().await.declared().is_empty() {
            return Ok(false);
        }
        let records: BTreeMap<String, SettingRecord> = self
            .retry
            .run(Request::FetchSettings, &mut report.retries, || {
                self.transport.fetch_settings()
            })
            .await?;

        let mut changed = false;
        let mut state = self.state.write().await;
        for entry in state.entries_mut() {
            if entry.status != DeclarationStatus::Declared {
                continue;
            }
            match records.get(&entry.declaration.name) {
                Some(record) => changed |= entry.update_server(ServerView::from(record)),
                None => {
                    warn!(
                        "Setting '{}' is missing on the service, declaring it again next cycle",
                        entry.declaration.name
                    );
                    entry.status = DeclarationStatus::Pending;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    /// Rule query for all declared settings, carrying the last ETag when it
    /// can be reused.
    async fn build_query(&self, views_changed: bool) -> RulesQuery {
        let state = self.state.read().await;
        let settings: Vec<String> = state
            .declared()
            .into_iter()
            .filter(|name| self.registry.contains(name))
            .collect();
        let mut query = RulesQuery {
            settings,
            context_filters: self.tracked(),
            etag: None,
        };

        let reusable = !views_changed
            && state
                .last_query
                .as_ref()
                .is_some_and(|last| last.same_request(&query))
            && query.settings.iter().all(|name| self.holds_own_store(name));
        if reusable {
            query.etag = state.etag.clone();
        }
        query
    }

    fn holds_own_store(&self, name: &str) -> bool {
        self.registry
            .get(name)
            .and_then(|s| s.store())
            .is_some_and(|store| store.client_id() == Some(self.client_id))
    }

    /// Convert fetched rules into new stores, one per setting.
    ///
    /// Also returns how many settings could not be updated.
    async fn build_updates(
        &self,
        query: &RulesQuery,
        rules: &BTreeMap<String, Vec<RuleRecord>>,
        report: &mut CycleReport,
    ) -> (Vec<PendingUpdate>, usize) {
        let mut state = self.state.write().await;
        let mut updates = Vec::new();
        let mut failed = 0;

        for name in &query.settings {
            let Some(setting) = self.registry.get(name) else {
                continue;
            };
            let Some(entry) = state.get_mut(name) else {
                continue;
            };
            let Some(view) = entry.server.clone() else {
                continue;
            };
            let records = rules.get(name).map(Vec::as_slice).unwrap_or_default();
            match self.build_update(&setting, entry, &view, &query.context_filters, records, report) {
                Ok(update) => updates.push(update),
                Err(e) => {
                    warn!("Keeping previous rules of setting '{}': {}", name, e);
                    failed += 1;
                }
            }
        }
        (updates, failed)
    }

    fn build_update(
        &self,
        setting: &Arc<Setting>,
        entry: &mut DeclarationEntry,
        view: &ServerView,
        tracked: &TrackedContexts,
        records: &[RuleRecord],
        report: &mut CycleReport,
    ) -> Result<PendingUpdate> {
        let name = setting.name();

        if type_diverges(setting.setting_type(), &view.setting_type) {
            if entry.reported_type.as_deref() != Some(view.setting_type.as_str()) {
                warn!(
                    "Setting '{}' is declared as {} on the service but {} locally, converting values to the local type",
                    name,
                    view.setting_type,
                    setting.setting_type()
                );
                entry.reported_type = Some(view.setting_type.clone());
            }
        } else {
            entry.reported_type = None;
        }

        let reconciliation = reconcile_features(setting.features(), &view.features)?;
        match &reconciliation.change {
            FeatureChange::Unchanged => entry.reported_features = None,
            change => {
                if entry.reported_features.as_ref() != Some(&view.features) {
                    match change {
                        FeatureChange::Shrunk { removed } => warn!(
                            "Setting '{}' is no longer configurable by {:?} on the service",
                            name, removed
                        ),
                        FeatureChange::Diverged { unknown, removed } => warn!(
                            "Configurable features of setting '{}' diverge from the service: unknown {:?}, missing {:?}",
                            name, unknown, removed
                        ),
                        _ => info!(
                            "Setting '{}' uses the service's feature order {}",
                            name, reconciliation.effective
                        ),
                    }
                    entry.reported_features = Some(view.features.clone());
                }
            }
        }
        let effective = reconciliation.effective;

        let server_default = match &view.default_value {
            None => DefaultUpdate::Clear,
            Some(raw) => match setting.convert_server_value(raw, None) {
                Ok((value, coercions)) => {
                    if !coercions.is_empty() {
                        info!(
                            "Coerced service default of setting '{}': {}",
                            name,
                            coercions.join("; ")
                        );
                        report.coercions += 1;
                    }
                    DefaultUpdate::Set(value)
                }
                Err(e) => {
                    warn!("Rejected service default of setting '{}': {}", name, e);
                    report.rejections += 1;
                    DefaultUpdate::Keep
                }
            },
        };

        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            if !tracked.allows(&record.conditions) {
                debug!(
                    "Discarding rule {} of setting '{}': outside tracked contexts",
                    record.rule_id, name
                );
                report.rules_discarded += 1;
                continue;
            }
            if let Some(feature) = record.conditions.keys().find(|f| !effective.contains(f)) {
                warn!(
                    "Discarding rule {} of setting '{}': feature '{}' is not configurable",
                    record.rule_id, name, feature
                );
                report.rules_discarded += 1;
                continue;
            }
            match setting.convert_server_value(&record.value, Some(&record.conditions)) {
                Ok((value, coercions)) => {
                    if !coercions.is_empty() {
                        info!(
                            "Coerced rule {} of setting '{}': {}",
                            record.rule_id,
                            name,
                            coercions.join("; ")
                        );
                        report.coercions += 1;
                    }
                    kept.push(Rule::new(
                        record.conditions.clone(),
                        record.value.clone(),
                        value,
                        RuleSource::Server {
                            rule_id: Some(record.rule_id),
                        },
                    ));
                }
                Err(e) => {
                    warn!(
                        "Rejected rule {} of setting '{}': {}",
                        record.rule_id, name, e
                    );
                    report.rejections += 1;
                }
            }
        }
        report.rules_loaded += kept.len();

        let store = RuleStore::new(name, effective, kept)
            .with_tracking(tracked.clone())
            .with_defaults(self.defaults.clone())
            .with_client(self.client_id);
        Ok(PendingUpdate {
            setting: setting.clone(),
            store,
            server_default,
        })
    }
}

/// Declaration record of a setting.
pub fn declaration_of(setting: &Setting) -> Declaration {
    Declaration {
        name: setting.name().to_string(),
        setting_type: setting.setting_type().wire_name(),
        configurable_features: setting.features().as_slice().to_vec(),
        default_value: setting
            .default_value()
            .map(|v| setting.setting_type().format(v)),
        metadata: setting.metadata().clone(),
        alias: setting.alias().map(str::to_string),
        version: setting.version().to_string(),
    }
}

fn log_ack(ack: &DeclarationAck) {
    if !ack.incomplete.is_empty() {
        warn!(
            "Declaration of setting '{}' is incomplete, the service kept {:?}",
            ack.name, ack.incomplete
        );
    }
    if !ack.changed.is_empty() {
        warn!(
            "Declaration of setting '{}' changed {:?} on the service",
            ack.name, ack.changed
        );
    }
    if ack.created {
        info!("Setting '{}' created on the service", ack.name);
    } else {
        debug!("Setting '{}' declared", ack.name);
    }
}
