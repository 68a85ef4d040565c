//! Per-bucket aggregate results, keyed by `"<MM>/<DD>/<bucket>"`.
//!
//! All writers of a bucket serialize through the named lock
//! `lock-<bucket>`, so the read-merge-write cycle of concurrent flushes
//! cannot lose counts.

use super::RESULT_TTL;
use crate::cache::{self, Cache};
use crate::entities::ScanResult;
use anyhow::{Context, Result};
use chrono::Datelike;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const LOCK_HOLD: Duration = Duration::from_secs(60);

pub struct AggregateRepository {
    cache: Arc<dyn Cache>,
}

impl AggregateRepository {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn item_key(day: u32, month: u32, bucket: &str) -> String {
        format!("{month:02}/{day:02}/{bucket}")
    }

    fn lock_key(bucket: &str) -> String {
        format!("lock-{bucket}")
    }

    /// Persist a result under the day of its `last_update`, holding the
    /// per-bucket lock for the write.
    pub async fn save(&self, result: &ScanResult) -> Result<()> {
        let lock_key = Self::lock_key(&result.bucket);
        cache::lock(self.cache.as_ref(), &lock_key, LOCK_HOLD).await?;

        let outcome = self.save_locked(result).await;

        if let Err(err) = self.cache.unlock(&lock_key).await {
            tracing::error!(bucket = %result.bucket, error = %err, "failed to unlock bucket");
        }
        outcome
    }

    async fn save_locked(&self, result: &ScanResult) -> Result<()> {
        let key = Self::item_key(
            result.last_update.day(),
            result.last_update.month(),
            &result.bucket,
        );
        let json = serde_json::to_string(result).context("failed to serialize scan result")?;
        self.cache.set(&key, json, Some(RESULT_TTL)).await
    }

    /// Fetch one bucket's result for a day, under the bucket lock. A missing
    /// entry is an empty result, not an error.
    pub async fn get_by_bucket_and_date(
        &self,
        bucket: &str,
        day: u32,
        month: u32,
    ) -> Result<ScanResult> {
        let lock_key = Self::lock_key(bucket);
        cache::lock(self.cache.as_ref(), &lock_key, LOCK_HOLD).await?;

        let outcome = self
            .read_single(&Self::item_key(day, month, bucket), bucket)
            .await;

        if let Err(err) = self.cache.unlock(&lock_key).await {
            tracing::error!(bucket, error = %err, "failed to unlock bucket");
        }
        outcome
    }

    /// All buckets for one day, merged per bucket.
    pub async fn get_by_date(&self, day: u32, month: u32) -> Result<HashMap<String, ScanResult>> {
        self.collect(&format!("{month:02}/{day:02}/*")).await
    }

    /// All buckets for one month, merged per bucket across its days.
    pub async fn get_by_month(&self, month: u32) -> Result<HashMap<String, ScanResult>> {
        self.collect(&format!("{month:02}/*")).await
    }

    async fn collect(&self, pattern: &str) -> Result<HashMap<String, ScanResult>> {
        let keys = self
            .cache
            .list(pattern)
            .await
            .context("failed to list aggregate keys")?;

        let mut results: HashMap<String, ScanResult> = HashMap::new();
        for key in keys {
            let Some(bucket) = key.splitn(3, '/').nth(2) else {
                tracing::warn!(key, "aggregate key has unexpected shape");
                continue;
            };
            let bucket = bucket.to_string();

            match self.read_single(&key, &bucket).await {
                Ok(result) => {
                    let merged = match results.get(&bucket) {
                        Some(existing) => ScanResult::merge(existing, &result),
                        None => result,
                    };
                    results.insert(bucket, merged);
                }
                Err(err) => {
                    tracing::error!(key, error = %err, "failed to read aggregate entry");
                }
            }
        }

        Ok(results)
    }

    async fn read_single(&self, key: &str, bucket: &str) -> Result<ScanResult> {
        match self.cache.get(key).await? {
            Some(json) => serde_json::from_str(&json)
                .with_context(|| format!("corrupt aggregate entry at {key}")),
            None => Ok(ScanResult::new(bucket)),
        }
    }
}
