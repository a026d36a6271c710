//! Transient progress entries keyed by `(operation, id)`.

use serde::Serialize;

/// Operation used when a progress message names none.
pub const DEFAULT_OPERATION: &str = "global";
/// Id used when a progress message names none.
pub const DEFAULT_ID: &str = "default";

/// Identity of one progress entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProgressKey {
    /// Operation name, e.g. `page.stream` or `analyze`.
    pub operation: String,
    /// Identifier within the operation.
    pub id: String,
}

impl ProgressKey {
    /// Creates a key.
    pub fn new(operation: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            id: id.into(),
        }
    }

    /// Key for a wire message, filling in the defaults.
    pub fn from_wire(operation: Option<&str>, id: Option<&str>) -> Self {
        Self::new(
            operation.unwrap_or(DEFAULT_OPERATION),
            id.unwrap_or(DEFAULT_ID),
        )
    }
}

/// One running operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEntry {
    /// Operation name.
    pub operation: String,
    /// Identifier within the operation.
    pub id: String,
    /// Completion percentage, within 0–100.
    pub percent: f64,
    /// Human readable label.
    pub label: String,
}

impl ProgressEntry {
    pub(crate) fn new(key: &ProgressKey, label: impl Into<String>) -> Self {
        Self {
            operation: key.operation.clone(),
            id: key.id.clone(),
            percent: 0.0,
            label: label.into(),
        }
    }

    /// Key of this entry.
    pub fn key(&self) -> ProgressKey {
        ProgressKey::new(&self.operation, &self.id)
    }
}

/// Clamps to 0–100. `NaN` counts as 0.
pub fn clamp_percent(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}
