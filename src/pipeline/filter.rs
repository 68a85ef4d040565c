//! Filter stage: decides which requests are worth scanning at all.
//!
//! Jobs run in order; the first `NextStage` short-circuits straight to the
//! scan path, an `Abort` discards the request, and a request that clears
//! every job moves on normally.

use super::stage::{Handler, OutputWriter};
use super::JobStatus;
use crate::entities::{ScanFlags, ScanRequest};
use crate::filetype;
use crate::services::DownloadService;
use crate::storage::SandboxFactory;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Bytes downloaded per key for the magic-byte sniff.
pub const HEADER_SIZE: u64 = 1024;

#[async_trait]
pub trait FilterJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn filter(&self, request: &mut ScanRequest) -> JobStatus;
}

/// Detects application binaries early by sniffing the first KiB of every
/// key. A binary goes straight to the scan stage; everything else keeps
/// filtering but gives up its external-scanner budget, because bulk
/// archives (container images, backups) full of executables would exhaust
/// it instantly.
pub struct ApplicationFilter {
    download: Arc<DownloadService>,
    sandbox_factory: Arc<SandboxFactory>,
}

impl ApplicationFilter {
    pub fn new(download: Arc<DownloadService>, sandbox_factory: Arc<SandboxFactory>) -> Self {
        Self {
            download,
            sandbox_factory,
        }
    }
}

#[async_trait]
impl FilterJob for ApplicationFilter {
    fn name(&self) -> &'static str {
        "application"
    }

    async fn filter(&self, request: &mut ScanRequest) -> JobStatus {
        if let Err(err) = self.download.download_header(request, HEADER_SIZE).await {
            tracing::error!(bucket = %request.bucket, error = %err,
                "failed to download headers");
            return JobStatus::Abort;
        }

        let sandbox = match self.sandbox_factory.get(&request.storage_id) {
            Ok(sandbox) => sandbox,
            Err(err) => {
                tracing::error!(bucket = %request.bucket, error = %err,
                    "failed to open local storage");
                return JobStatus::Abort;
            }
        };

        for key in &request.keys {
            let mut file = match sandbox.open(key) {
                Ok(file) => file,
                Err(err) => {
                    tracing::error!(bucket = %request.bucket, key, error = %err,
                        "failed to open downloaded header");
                    return JobStatus::Abort;
                }
            };

            if filetype::is_executable(&mut file) {
                tracing::info!(bucket = %request.bucket, key,
                    "binary application detected, file will be scanned");
                return JobStatus::NextStage;
            }
        }

        request.flags.insert(ScanFlags::DISABLE_EXTERNAL_SCAN);
        JobStatus::NextJob
    }
}

/// Samples configured buckets: a request only survives its bucket's raffle.
pub struct ProbabilisticFilter {
    probabilities: HashMap<String, f64>,
}

impl ProbabilisticFilter {
    pub fn new(probabilities: HashMap<String, f64>) -> Self {
        Self { probabilities }
    }
}

#[async_trait]
impl FilterJob for ProbabilisticFilter {
    fn name(&self) -> &'static str {
        "probabilistic"
    }

    async fn filter(&self, request: &mut ScanRequest) -> JobStatus {
        if let Some(&probability) = self.probabilities.get(&request.bucket) {
            let draw: f64 = rand::thread_rng().gen();
            if draw >= probability {
                tracing::debug!(bucket = %request.bucket, keys = ?request.keys,
                    "file was not selected for scan");
                return JobStatus::Abort;
            }
        }
        JobStatus::NextJob
    }
}

/// Discards allow-listed prefixes and oversized objects.
pub struct BypassFilter {
    allowlist: HashMap<String, Vec<String>>,
    size_limit: u64,
}

impl BypassFilter {
    pub fn new(allowlist: HashMap<String, Vec<String>>, size_limit: u64) -> Self {
        for (bucket, prefixes) in &allowlist {
            for prefix in prefixes {
                if !prefix.ends_with('/') {
                    tracing::info!(bucket, prefix,
                        "allow-list prefix without trailing slash may match more than intended");
                }
            }
        }
        Self {
            allowlist,
            size_limit,
        }
    }
}

#[async_trait]
impl FilterJob for BypassFilter {
    fn name(&self) -> &'static str {
        "bypass"
    }

    async fn filter(&self, request: &mut ScanRequest) -> JobStatus {
        if let Some(prefixes) = self.allowlist.get(&request.bucket) {
            if prefixes
                .iter()
                .any(|prefix| request.keys[0].starts_with(prefix))
            {
                return JobStatus::Abort;
            }
        }

        if request.size > self.size_limit {
            return JobStatus::Abort;
        }

        JobStatus::NextJob
    }
}

/// Runs the filter jobs in order.
pub struct FilterHandler {
    jobs: Vec<Arc<dyn FilterJob>>,
}

impl FilterHandler {
    pub fn new(jobs: Vec<Arc<dyn FilterJob>>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Handler<ScanRequest, ScanRequest> for FilterHandler {
    fn name(&self) -> String {
        let jobs: Vec<&str> = self.jobs.iter().map(|job| job.name()).collect();
        format!("filter handler with jobs: {}", jobs.join(", "))
    }

    async fn handle(
        &self,
        request: &mut ScanRequest,
        out: &OutputWriter<ScanRequest>,
    ) -> anyhow::Result<()> {
        for job in &self.jobs {
            tracing::debug!(job = job.name(), "running job");
            match job.filter(request).await {
                JobStatus::NextJob => {}
                JobStatus::NextStage => {
                    out.write(request.clone()).await;
                    return Ok(());
                }
                JobStatus::Abort => anyhow::bail!("request filtered"),
            }
        }

        out.write(request.clone()).await;
        Ok(())
    }
}
