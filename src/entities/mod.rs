//! Core domain types shared across the pipeline.
//!
//! - [`ScanRequest`] - unit of work flowing through the stages
//! - [`ScanResult`] - per-request and per-bucket scan outcome
//! - [`ScheduleItem`] / [`ScheduleItemWithState`] - external-scan handles and
//!   user-scheduled scan lifecycle records

mod request;
mod result;
mod schedule;

pub use request::{ResultType, ScanFlags, ScanRequest};
pub use result::{generate_entropy_buckets, merge_entropy, ScanResult, NO_BUCKET};
pub use schedule::{ScheduleItem, ScheduleItemWithState, ScheduleStatus};
