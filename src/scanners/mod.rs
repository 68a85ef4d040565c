//! Scanner capability interfaces and the per-file scan context.
//!
//! Scanners come in two capability sets: synchronous ones produce their
//! part of the result inline, asynchronous ones schedule work with an
//! external service and surface verdicts later through a collector.

pub mod entropy;
pub mod external;
pub mod yara;

pub use entropy::EntropyScanner;
pub use external::ExternalScanScheduler;
pub use yara::YaraScanner;

use crate::entities::{ScanFlags, ScanResult};
use crate::filetype::FileKind;
use crate::storage::Sandbox;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Everything a scanner needs to process one file of one request.
#[derive(Clone)]
pub struct ScanContext {
    pub scan_id: String,
    pub bucket: String,
    /// Primary object key of the request the file belongs to.
    pub key: String,
    pub flags: ScanFlags,
    pub storage: Arc<Sandbox>,
    /// Path of the file inside the sandbox.
    pub filename: String,
    pub kind: FileKind,
}

/// A scanner producing its verdict inline. Runs on the blocking pool; the
/// shared `buffer` bounds how much of a file sits in memory at once.
pub trait SyncScanner: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn scan(&self, ctx: &ScanContext, buffer: &mut [u8]) -> Result<ScanResult>;
}

/// A scanner whose verdicts arrive out of band.
#[async_trait]
pub trait AsyncScanner: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Enqueue external analysis for the file if it qualifies. The returned
    /// result carries at most bookkeeping counts; real verdicts come
    /// through [`AsyncScanner::collect_results`].
    async fn schedule_scan(&self, ctx: &ScanContext) -> Result<ScanResult>;

    /// Harvest verdicts that have become available since the last call.
    async fn collect_results(&self) -> Vec<ScanResult>;
}
