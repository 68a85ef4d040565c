//! Scan stage: walks the sandbox and fans each file out to the scanners.
//!
//! Multimedia files are bypassed (their false-positive rate buys nothing),
//! compressed files reaching this stage are a pre-processing bug and count
//! as errors, and everything else gets the full treatment: external
//! scheduling plus every synchronous scanner, merged into one result.

use super::stage::{Handler, OutputWriter};
use crate::entities::{ScanRequest, ScanResult};
use crate::filetype::{self, FileKind};
use crate::scanners::{AsyncScanner, ScanContext, SyncScanner};
use crate::storage::SandboxFactory;
use anyhow::bail;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared read buffer handed to the synchronous scanners.
const SCAN_BUFFER_SIZE: usize = 1024 * 1024;

pub struct ScanService {
    sandbox_factory: Arc<SandboxFactory>,
    sync_scanners: Arc<Vec<Arc<dyn SyncScanner>>>,
    async_scanners: Vec<Arc<dyn AsyncScanner>>,
}

impl ScanService {
    pub fn new(
        sandbox_factory: Arc<SandboxFactory>,
        sync_scanners: Vec<Arc<dyn SyncScanner>>,
        async_scanners: Vec<Arc<dyn AsyncScanner>>,
    ) -> Self {
        Self {
            sandbox_factory,
            sync_scanners: Arc::new(sync_scanners),
            async_scanners,
        }
    }

    /// Scan every file of the request's sandbox and merge the outcomes.
    pub async fn scan(&self, request: &ScanRequest) -> ScanResult {
        let storage = match self.sandbox_factory.get(&request.storage_id) {
            Ok(storage) => storage,
            Err(err) => {
                tracing::error!(storage_id = %request.storage_id, error = %err,
                    "failed to open local storage");
                return ScanResult::default();
            }
        };

        let files = match storage.list_files("") {
            Ok(files) => files,
            Err(err) => {
                tracing::error!(storage_id = %request.storage_id, error = %err,
                    "failed to walk sandbox");
                return ScanResult::default();
            }
        };

        let mut result = ScanResult::new(&request.bucket);
        let mut sync_targets: Vec<(String, FileKind)> = Vec::new();

        for filename in files {
            let kind = match self.classify(&storage, &filename) {
                Ok(kind) => kind,
                Err(err) => {
                    tracing::error!(filename, error = %err, "could not classify file");
                    result.errors += 1;
                    continue;
                }
            };

            match kind {
                FileKind::Multimedia => {
                    // Not scanned: image and video matching drowns in false
                    // positives.
                    result.bypassed += 1;
                }
                FileKind::Compressed => {
                    tracing::error!(filename, bucket = %request.bucket,
                        "file still compressed after pre-processing");
                    result.errors += 1;
                }
                FileKind::Executable | FileKind::Uncompressed => {
                    let ctx = ScanContext {
                        scan_id: request.scan_id.clone(),
                        bucket: request.bucket.clone(),
                        key: request.keys[0].clone(),
                        flags: request.flags,
                        storage: storage.clone(),
                        filename: filename.clone(),
                        kind,
                    };

                    for scanner in &self.async_scanners {
                        match scanner.schedule_scan(&ctx).await {
                            Ok(partial) => result = ScanResult::merge(&result, &partial),
                            Err(err) => {
                                tracing::error!(scanner = scanner.name(), filename,
                                    bucket = %request.bucket, error = %err,
                                    "async scan scheduling failed");
                                result.errors += 1;
                            }
                        }
                    }

                    sync_targets.push((filename, kind));
                }
            }
        }

        let sync_result = self.run_sync_scanners(request, sync_targets).await;
        result = ScanResult::merge(&result, &sync_result);

        result.scan_id = request.scan_id.clone();
        result.result_type = request.result_type;
        result.requests += 1;

        tracing::debug!(bucket = %request.bucket, keys = ?request.keys, ?result,
            "scan executed");
        result
    }

    fn classify(
        &self,
        storage: &Arc<crate::storage::Sandbox>,
        filename: &str,
    ) -> anyhow::Result<FileKind> {
        if !storage.exists(filename) || !storage.is_regular(filename)? {
            bail!("file is missing or not a regular file");
        }

        let mut file = storage.open(filename)?;
        Ok(filetype::detect_kind(&mut file)?)
    }

    /// All synchronous scanners over all scannable files, on the blocking
    /// pool with one shared buffer.
    async fn run_sync_scanners(
        &self,
        request: &ScanRequest,
        targets: Vec<(String, FileKind)>,
    ) -> ScanResult {
        if targets.is_empty() {
            return ScanResult::new("");
        }

        let scanners = self.sync_scanners.clone();
        let storage = match self.sandbox_factory.get(&request.storage_id) {
            Ok(storage) => storage,
            Err(_) => return ScanResult::new(""),
        };
        let scan_id = request.scan_id.clone();
        let bucket = request.bucket.clone();
        let key = request.keys[0].clone();
        let flags = request.flags;

        let outcome = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; SCAN_BUFFER_SIZE];
            let mut merged = ScanResult::new("");

            for (filename, kind) in targets {
                merged.scanned += 1;

                let ctx = ScanContext {
                    scan_id: scan_id.clone(),
                    bucket: bucket.clone(),
                    key: key.clone(),
                    flags,
                    storage: storage.clone(),
                    filename,
                    kind,
                };

                for scanner in scanners.iter() {
                    match scanner.scan(&ctx, &mut buffer) {
                        Ok(partial) => merged = ScanResult::merge(&merged, &partial),
                        Err(err) => {
                            tracing::error!(scanner = scanner.name(),
                                filename = %ctx.filename, error = %err,
                                "scan executed with error");
                            merged.errors += 1;
                        }
                    }
                }
            }

            merged
        })
        .await;

        match outcome {
            Ok(merged) => merged,
            Err(err) => {
                tracing::error!(error = %err, "sync scan task failed");
                let mut failed = ScanResult::new("");
                failed.errors += 1;
                failed
            }
        }
    }
}

/// Stage handler around [`ScanService`].
///
/// Always returns an error after writing its result: the stage framework
/// then routes the request to cleanup, which releases the sandbox and the
/// queue message no matter how the scan went.
pub struct ScanHandler {
    service: Arc<ScanService>,
    async_scanners: Vec<Arc<dyn AsyncScanner>>,
    collect_interval: Duration,
}

impl ScanHandler {
    pub fn new(
        service: Arc<ScanService>,
        async_scanners: Vec<Arc<dyn AsyncScanner>>,
        collect_interval: Duration,
    ) -> Self {
        Self {
            service,
            async_scanners,
            collect_interval,
        }
    }

    /// Periodic worker harvesting external verdicts and injecting them into
    /// the notification channel as synthetic results.
    pub fn spawn_result_collector(
        &self,
        output: mpsc::Sender<ScanResult>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let scanners = self.async_scanners.clone();
        let interval = self.collect_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        for scanner in &scanners {
                            tracing::debug!(scanner = scanner.name(),
                                "collecting external results");
                            for result in scanner.collect_results().await {
                                tokio::select! {
                                    _ = token.cancelled() => return,
                                    _ = output.send(result) => {}
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Handler<ScanRequest, ScanResult> for ScanHandler {
    fn name(&self) -> String {
        "scan handler".to_string()
    }

    async fn handle(
        &self,
        request: &mut ScanRequest,
        out: &OutputWriter<ScanResult>,
    ) -> anyhow::Result<()> {
        let result = self.service.scan(request).await;
        out.write(result).await;
        crate::metrics::SCANS_COMPLETED.inc();

        // Intentional: the error routes the request to cleanup even on
        // success, which is where storage and queue release happen.
        bail!("enforce cleanup")
    }
}
