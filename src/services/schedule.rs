//! Lifecycle of user-scheduled scans.
//!
//! Submitted artifacts are copied into the scanner's own internal bucket so
//! their lifetime is not tied to the submitter, then tracked through
//! Waiting → Running → Completed/Error. Records are stored twice, under the
//! scan id and under the object key, because the pipeline only knows the
//! key while API clients only know the scan id.

use crate::cache::Cache;
use crate::entities::{ScheduleItemWithState, ScheduleStatus};
use crate::storage::RemoteStorageFactory;
use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// A record stuck in Waiting or Running longer than this is flipped to
/// Error on the next read.
const STALE_AFTER: i64 = 60 * 60;

pub struct ScheduleService {
    internal_bucket: String,
    remote_factory: Arc<RemoteStorageFactory>,
    cache: Arc<dyn Cache>,
}

impl ScheduleService {
    pub fn new(
        remote_factory: Arc<RemoteStorageFactory>,
        cache: Arc<dyn Cache>,
        internal_bucket: &str,
    ) -> Self {
        Self {
            internal_bucket: internal_bucket.to_string(),
            remote_factory,
            cache,
        }
    }

    /// The pipeline recognizes user-initiated scans by their bucket.
    pub fn is_scheduled_scan(&self, bucket: &str) -> bool {
        bucket == self.internal_bucket
    }

    /// Copy an existing object into the internal bucket and schedule it.
    pub async fn schedule_object(&self, bucket: &str, key: &str) -> Result<String> {
        let storage = self
            .remote_factory
            .get("s3")
            .context("access to service repository failed")?;

        let data = storage
            .fetch(bucket, key)
            .await
            .with_context(|| format!("failed to get object {bucket}/{key}"))?;

        self.schedule(key, data).await
    }

    /// Store the artifact in the internal bucket and create a Waiting
    /// record. Returns the scan id clients poll with.
    pub async fn schedule(&self, filename: &str, data: Vec<u8>) -> Result<String> {
        let storage = self
            .remote_factory
            .get("s3")
            .context("access to service repository failed")?;
        storage
            .store(&self.internal_bucket, filename, data)
            .await
            .context("failed to save file in the service repository")?;

        let scan_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let item = ScheduleItemWithState {
            scan_id: scan_id.clone(),
            bucket: self.internal_bucket.clone(),
            key: filename.to_string(),
            filename: filename.to_string(),
            create_time: now,
            last_update: now,
            status: ScheduleStatus::Waiting,
        };

        self.save(&item).await?;
        Ok(scan_id)
    }

    /// Move a record to a new status, touching `last_update`.
    pub async fn update(&self, id_or_key: &str, status: ScheduleStatus) -> Result<()> {
        let Some(mut item) = self.get(id_or_key).await? else {
            bail!("no schedule record for {id_or_key}");
        };

        item.status = status;
        item.last_update = Utc::now();
        self.save(&item).await
    }

    /// Fetch a record by scan id or object key. A record stuck in
    /// Waiting/Running past the staleness limit is persisted as Error
    /// before being returned.
    pub async fn get(&self, id_or_key: &str) -> Result<Option<ScheduleItemWithState>> {
        let Some(json) = self.cache.get(&record_key(id_or_key)).await? else {
            return Ok(None);
        };

        let mut item: ScheduleItemWithState = serde_json::from_str(&json)
            .with_context(|| format!("corrupt schedule record for {id_or_key}"))?;

        if !is_stale(&item) {
            return Ok(Some(item));
        }

        item.status = ScheduleStatus::Error;
        item.last_update = Utc::now();
        self.save(&item).await?;
        Ok(Some(item))
    }

    async fn save(&self, item: &ScheduleItemWithState) -> Result<()> {
        let json = serde_json::to_string(item).context("failed to serialize schedule record")?;

        self.cache
            .set(&record_key(&item.scan_id), json.clone(), None)
            .await
            .with_context(|| format!("failed to save record for scan id {}", item.scan_id))?;
        self.cache
            .set(&record_key(&item.key), json, None)
            .await
            .with_context(|| format!("failed to save record for key {}", item.key))
    }
}

fn record_key(id_or_key: &str) -> String {
    format!("schedule-{id_or_key}")
}

fn is_stale(item: &ScheduleItemWithState) -> bool {
    matches!(
        item.status,
        ScheduleStatus::Waiting | ScheduleStatus::Running
    ) && item.last_update < Utc::now() - ChronoDuration::seconds(STALE_AFTER)
}
