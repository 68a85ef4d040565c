//! The multi-stage scan pipeline.
//!
//! Requests flow filter → preprocess → scan → notification; every stage
//! forwards failed or finished requests to the cleanup stage through a
//! sideband channel. [`stage`] holds the generic worker; the sibling
//! modules hold the per-stage handlers.

pub mod cleanup;
pub mod filter;
pub mod notification;
pub mod preprocess;
pub mod scan;
pub mod stage;

pub use stage::{CleanupMessage, Handler, OutputWriter, Stage};

/// Verdict of one job inside a multi-job handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Continue with the next job of the same stage.
    NextJob,
    /// Forward the request to the next stage immediately, skipping the
    /// remaining jobs.
    NextStage,
    /// Discard the request; it goes to cleanup.
    Abort,
}
