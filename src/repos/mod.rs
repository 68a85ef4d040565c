//! Cache-backed persistence for scan results and schedule handles.

mod aggregate;
mod individual;
mod schedule_queue;

pub use aggregate::AggregateRepository;
pub use individual::IndividualRepository;
pub use schedule_queue::ScheduleQueueRepository;

use std::time::Duration;

/// Retention of persisted scan results: one month plus a safety margin so a
/// monthly report can still see the whole previous month.
pub const RESULT_TTL: Duration = Duration::from_secs(32 * 24 * 60 * 60);
