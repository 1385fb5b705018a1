//! Reconciliation of local declarations with the service's view.

use serde::{Deserialize, Serialize};

use switchyard_common::{Features, Result};
use switchyard_schema::SettingType;

/// How the service's configurable features relate to the local ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureChange {
    Unchanged,
    /// Same features in a different priority order.
    Reordered,
    /// The service knows a strict subset of the local features.
    Shrunk { removed: Vec<String> },
    /// The service has features the local declaration does not.
    Diverged {
        unknown: Vec<String>,
        removed: Vec<String>,
    },
}

impl FeatureChange {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, FeatureChange::Unchanged)
    }
}

/// Effective features of a setting and how they were derived.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureReconciliation {
    /// Service features that are also local, in service order.
    pub effective: Features,
    pub change: FeatureChange,
}

/// Intersect local features with the service's, keeping service order.
///
/// # Errors
/// - The service feature list is not a valid feature set
pub fn reconcile_features(local: &Features, server: &[String]) -> Result<FeatureReconciliation> {
    let server = Features::new(server.iter().cloned())?;
    let effective = server.intersect(local);
    let unknown = server.difference(local);
    let removed = local.difference(&server);

    let change = if !unknown.is_empty() {
        FeatureChange::Diverged { unknown, removed }
    } else if !removed.is_empty() {
        FeatureChange::Shrunk { removed }
    } else if server.as_slice() != local.as_slice() {
        FeatureChange::Reordered
    } else {
        FeatureChange::Unchanged
    };

    Ok(FeatureReconciliation { effective, change })
}

/// Whether the service declares a different type than the local one.
pub fn type_diverges(local: &SettingType, server_type: &str) -> bool {
    local.wire_name() != server_type
}
