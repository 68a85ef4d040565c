//! Asynchronous external-scanner integration.
//!
//! Scheduling submits an executable's bytes to the external service and
//! persists a handle in the wait list. Collection drains handles that have
//! had time to complete, polls their verdicts, re-enqueues unfinished ones,
//! and converts malicious verdicts into synthetic scan results that flow
//! straight into the notification stage.

use super::{AsyncScanner, ScanContext};
use crate::entities::{ScanFlags, ScanResult, ScheduleItem};
use crate::external::{ExternalScan, Outcome};
use crate::filetype::FileKind;
use crate::repos::ScheduleQueueRepository;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

/// Handles older than this are dropped instead of polled; the external
/// service is not going to answer them anymore.
const EXPIRATION_SECS: i64 = 60 * 60;

pub struct ExternalScanScheduler {
    scanner: Arc<dyn ExternalScan>,
    repository: Arc<ScheduleQueueRepository>,
    /// Minimum age of a handle before its first poll.
    query_interval: Duration,
}

impl ExternalScanScheduler {
    pub fn new(
        scanner: Arc<dyn ExternalScan>,
        repository: Arc<ScheduleQueueRepository>,
        query_interval: Duration,
    ) -> Self {
        if !scanner.is_available() {
            tracing::info!(
                "external scanner not configured, executables will only get local scans"
            );
        }
        Self {
            scanner,
            repository,
            query_interval,
        }
    }

    fn should_scan(&self, ctx: &ScanContext) -> bool {
        ctx.kind == FileKind::Executable
            && !ctx.flags.contains(ScanFlags::DISABLE_EXTERNAL_SCAN)
    }
}

#[async_trait]
impl AsyncScanner for ExternalScanScheduler {
    fn name(&self) -> &'static str {
        "external"
    }

    async fn schedule_scan(&self, ctx: &ScanContext) -> Result<ScanResult> {
        if !self.scanner.is_available() || !self.should_scan(ctx) {
            return Ok(ScanResult::new(""));
        }

        let storage = ctx.storage.clone();
        let filename = ctx.filename.clone();
        let data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut file = storage
                .open(&filename)
                .with_context(|| format!("failed to open {filename}"))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .with_context(|| format!("failed to read {filename}"))?;
            Ok(data)
        })
        .await
        .context("read task failed")??;

        let status = self.scanner.scan_binary(&data).await;
        if status.outcome != Outcome::InProgress {
            bail!(
                "external submission for {} did not enter analysis: {:?} ({})",
                ctx.filename,
                status.outcome,
                status.detail.unwrap_or_default()
            );
        }

        self.repository
            .add(
                &status.id,
                &ScheduleItem {
                    scan_id: status.id.clone(),
                    bucket: ctx.bucket.clone(),
                    key: ctx.key.clone(),
                    filename: ctx.filename.clone(),
                    create_time: Utc::now(),
                },
            )
            .await
            .context("failed to persist external scan handle")?;

        Ok(ScanResult::new(""))
    }

    async fn collect_results(&self) -> Vec<ScanResult> {
        let limit = Utc::now()
            - ChronoDuration::from_std(self.query_interval).unwrap_or(ChronoDuration::zero());

        let (items, errors) = match self.repository.get_until(limit).await {
            Ok(drained) => drained,
            Err(err) => {
                tracing::error!(error = %err, "failed to drain external scan handles");
                return Vec::new();
            }
        };
        for err in errors {
            tracing::error!(error = %err, "failed to resolve a scheduled handle");
        }

        let mut results = Vec::new();
        let expiration_limit = Utc::now() - ChronoDuration::seconds(EXPIRATION_SECS);

        for item in items {
            if item.create_time < expiration_limit {
                tracing::error!(
                    scan_id = %item.scan_id,
                    bucket = %item.bucket,
                    "external analysis never finished within the time limit, dropping"
                );
                continue;
            }

            let status = self.scanner.get_scan_result(&item.scan_id).await;
            match status.outcome {
                Outcome::InProgress => {
                    tracing::info!(scan_id = %item.scan_id, "analysis still pending, requeueing");
                    if let Err(err) = self.repository.add(&item.scan_id, &item).await {
                        tracing::error!(scan_id = %item.scan_id, error = %err,
                            "failed to requeue handle");
                    }
                }
                Outcome::Benign => {
                    tracing::debug!(scan_id = %item.scan_id, "external verdict: undetected");
                }
                Outcome::Malicious => {
                    tracing::warn!(scan_id = %item.scan_id, bucket = %item.bucket,
                        "external verdict: malicious");
                    let mut result = ScanResult::new(&item.bucket);
                    result.matches = 1;
                    results.push(result);
                }
                Outcome::Error
                | Outcome::Unseen
                | Outcome::DecodeError
                | Outcome::InvalidId => {
                    tracing::error!(scan_id = %item.scan_id, outcome = ?status.outcome,
                        "failed to get verdict from external service");
                }
            }
        }

        results
    }
}
