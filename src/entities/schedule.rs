//! Records tracking scans that wait on something external: a verdict from the
//! external scanner, or a user-scheduled scan moving through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a user-scheduled scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Waiting,
    Running,
    Completed,
    Error,
}

/// An outstanding external-scan handle waiting for a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItem {
    /// Handle returned by the external scanner on submission.
    pub scan_id: String,
    pub bucket: String,
    pub key: String,
    /// Path of the submitted file inside its sandbox.
    pub filename: String,
    pub create_time: DateTime<Utc>,
}

/// A user-scheduled scan with its lifecycle state. Stored under both
/// `schedule-<scan_id>` and `schedule-<key>` so it can be looked up by
/// either identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItemWithState {
    pub scan_id: String,
    pub bucket: String,
    pub key: String,
    pub filename: String,
    pub create_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub status: ScheduleStatus,
}
