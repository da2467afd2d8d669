//! Storage-side records that are not part of the timetable model.

use serde::{Deserialize, Serialize};

/// A persisted setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Setting name, e.g. `capture.target_host`.
    pub key: String,
    /// JSON value.
    pub value: serde_json::Value,
}
