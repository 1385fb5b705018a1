//! Switchyard client
//!
//! Keeps locally declared settings in step with a configuration service:
//! - Declares settings and reconciles the service's view with the local one
//! - Fetches rules for the tracked contexts, reusing ETags when nothing changed
//! - Refreshes periodically or on demand from a background task
//! - Offers a blocking facade and a stub client for tests

pub mod blocking;
pub mod client;
pub mod engine;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod stub;

// Re-export main types
pub use blocking::BlockingClient;
pub use client::Client;
pub use engine::{declaration_of, SyncConfig, SyncEngine};
pub use reconcile::{reconcile_features, FeatureChange, FeatureReconciliation};
pub use retry::{Backoff, Request, RetryPolicy};
pub use scheduler::{CycleReport, NoopHooks, Scheduler, SchedulerState, UpdateHooks};
pub use state::{DeclarationEntry, DeclarationStatus, ServerView, SyncState};
pub use stub::{Patch, PatchGuard, StubClient, StubRule};

pub use switchyard_common::{Context, Error, Features, Result, TrackedContexts, Version};
pub use switchyard_rules::{DefaultSource, Registry, Rule, Setting};
pub use switchyard_schema::{SettingType, Value};
pub use switchyard_transport::{MemoryTransport, Transport};
