//! Cleanup stage: releases external resources for every request that left
//! a stage, successfully or not.

use super::stage::{CleanupMessage, Handler, OutputWriter};
use crate::entities::{ScanRequest, ScheduleStatus};
use crate::queue::EventQueue;
use crate::services::ScheduleService;
use crate::storage::SandboxFactory;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait CleanupJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn clean(&self, message: &CleanupMessage<ScanRequest>);
}

/// Acknowledges the originating queue message, if any. HTTP-origin
/// requests carry no message id and are skipped. A failed delete is only
/// logged: the message reappears after its visibility timeout and the scan
/// runs again, which is tolerable.
pub struct QueueCleanup {
    queue: Arc<dyn EventQueue>,
}

impl QueueCleanup {
    pub fn new(queue: Arc<dyn EventQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl CleanupJob for QueueCleanup {
    fn name(&self) -> &'static str {
        "queue-cleanup"
    }

    async fn clean(&self, message: &CleanupMessage<ScanRequest>) {
        let request = &message.request;
        if request.message_id.is_empty() {
            return;
        }

        tracing::debug!(message_id = %request.message_id, "deleting queue message");
        if let Err(err) = self.queue.delete(&request.message_id).await {
            tracing::error!(message_id = %request.message_id, error = %err,
                "failed to delete message from queue");
        }
    }
}

/// Destroys the request's sandbox and releases its quota.
pub struct StorageCleanup {
    sandbox_factory: Arc<SandboxFactory>,
}

impl StorageCleanup {
    pub fn new(sandbox_factory: Arc<SandboxFactory>) -> Self {
        Self { sandbox_factory }
    }
}

#[async_trait]
impl CleanupJob for StorageCleanup {
    fn name(&self) -> &'static str {
        "storage-cleanup"
    }

    async fn clean(&self, message: &CleanupMessage<ScanRequest>) {
        let request = &message.request;
        tracing::debug!(storage_id = %request.storage_id, "destroying sandbox");

        if let Err(err) = self.sandbox_factory.destroy(&request.storage_id) {
            tracing::error!(storage_id = %request.storage_id, error = %err,
                "failed to destroy sandbox");
        }
    }
}

/// Marks user-scheduled scans Completed. A scan that failed earlier
/// already carries the Error state and the update simply moves it to its
/// terminal success state only when the pipeline got all the way through.
pub struct ScheduleCleanup {
    schedule: Arc<ScheduleService>,
}

impl ScheduleCleanup {
    pub fn new(schedule: Arc<ScheduleService>) -> Self {
        Self { schedule }
    }
}

#[async_trait]
impl CleanupJob for ScheduleCleanup {
    fn name(&self) -> &'static str {
        "schedule-cleanup"
    }

    async fn clean(&self, message: &CleanupMessage<ScanRequest>) {
        let request = &message.request;
        if !self.schedule.is_scheduled_scan(&request.bucket) {
            return;
        }

        if let Err(err) = self
            .schedule
            .update(&request.scan_id, ScheduleStatus::Completed)
            .await
        {
            tracing::error!(scan_id = %request.scan_id, error = %err,
                "failed to update schedule scan status");
        }
    }
}

/// Runs every cleanup job for every message.
pub struct CleanupHandler {
    jobs: Vec<Arc<dyn CleanupJob>>,
}

impl CleanupHandler {
    pub fn new(jobs: Vec<Arc<dyn CleanupJob>>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Handler<CleanupMessage<ScanRequest>, ()> for CleanupHandler {
    fn name(&self) -> String {
        let jobs: Vec<&str> = self.jobs.iter().map(|job| job.name()).collect();
        format!("cleanup handler with jobs: {}", jobs.join(", "))
    }

    async fn handle(
        &self,
        message: &mut CleanupMessage<ScanRequest>,
        _out: &OutputWriter<()>,
    ) -> anyhow::Result<()> {
        for job in &self.jobs {
            tracing::debug!(job = job.name(), "running job");
            job.clean(message).await;
        }
        Ok(())
    }
}
