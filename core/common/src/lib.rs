//! Common utilities and types shared across Switchyard modules.
//!
//! This module provides the error taxonomy, lookup contexts, feature sets
//! and the tracked-context filter used by every other crate.

pub mod error;
pub mod tracking;
pub mod types;

pub use error::{Error, Result};
pub use tracking::{Tracked, TrackedContexts, TRACK_ALL};
pub use types::{Context, Features, Version, MAX_FEATURES};
