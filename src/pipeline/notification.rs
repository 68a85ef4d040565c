//! Notification stage: turns scan results into persisted statistics and
//! outbound alerts.
//!
//! Handlers consume every result synchronously through `update` and flush
//! their accumulated state on a shared ticker. The accumulator mutexes are
//! never held across repository or viewer I/O: a flush drains under the
//! lock, works unlocked, and merges failures back for the next round.

use super::stage::{Handler, OutputWriter};
use crate::entities::{ResultType, ScanResult};
use crate::repos::{AggregateRepository, IndividualRepository};
use crate::viewers::Viewer;
use async_trait::async_trait;
use chrono::Datelike;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait NotificationJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Consume one result.
    async fn update(&self, result: &ScanResult);

    /// Push accumulated state out (to the repositories or the viewers).
    async fn flush(&self);
}

/// Accumulates Aggregate results per bucket and merges them into the
/// repository on flush, under the repository's per-bucket lock.
pub struct AggregateStatistics {
    stats: Mutex<HashMap<String, ScanResult>>,
    repository: Arc<AggregateRepository>,
}

impl AggregateStatistics {
    pub fn new(repository: Arc<AggregateRepository>) -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            repository,
        }
    }

    fn merge_back(&self, bucket: String, value: ScanResult) {
        let mut stats = self.stats.lock();
        let merged = match stats.get(&bucket) {
            Some(existing) => ScanResult::merge(existing, &value),
            None => value,
        };
        stats.insert(bucket, merged);
    }
}

#[async_trait]
impl NotificationJob for AggregateStatistics {
    fn name(&self) -> &'static str {
        "aggregate-statistics"
    }

    async fn update(&self, result: &ScanResult) {
        if result.result_type != ResultType::Aggregate {
            return;
        }

        self.merge_back(result.bucket.clone(), result.clone());
    }

    async fn flush(&self) {
        let drained: HashMap<String, ScanResult> = std::mem::take(&mut *self.stats.lock());

        for (bucket, value) in drained {
            let persisted = match self
                .repository
                .get_by_bucket_and_date(&bucket, value.last_update.day(), value.last_update.month())
                .await
            {
                Ok(persisted) => persisted,
                Err(err) => {
                    tracing::error!(bucket, error = %err,
                        "could not obtain previous result, keeping counts for next flush");
                    self.merge_back(bucket, value);
                    continue;
                }
            };

            let mut updated = ScanResult::merge(&persisted, &value);
            updated.bucket = bucket.clone();

            if let Err(err) = self.repository.save(&updated).await {
                tracing::error!(bucket, error = %err,
                    "failed to save updated bucket result, keeping counts for next flush");
                self.merge_back(bucket, value);
            }
        }
    }
}

/// Persists each Individual result under its scan id as it arrives.
pub struct IndividualStatistics {
    repository: Arc<IndividualRepository>,
}

impl IndividualStatistics {
    pub fn new(repository: Arc<IndividualRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl NotificationJob for IndividualStatistics {
    fn name(&self) -> &'static str {
        "individual-statistics"
    }

    async fn update(&self, result: &ScanResult) {
        if result.result_type != ResultType::Individual {
            return;
        }

        if let Err(err) = self.repository.save(result).await {
            tracing::error!(scan_id = %result.scan_id, error = %err,
                "failed to persist individual result");
        }
    }

    async fn flush(&self) {}
}

/// Counts matches per bucket and broadcasts an alert through every viewer
/// on flush. The counter only resets when at least one viewer accepted the
/// message; otherwise the counts roll into the next flush.
pub struct EmergencyService {
    matches_per_bucket: Mutex<HashMap<String, i64>>,
    viewers: Vec<Arc<dyn Viewer>>,
}

impl EmergencyService {
    pub fn new(viewers: Vec<Arc<dyn Viewer>>) -> Self {
        Self {
            matches_per_bucket: Mutex::new(HashMap::new()),
            viewers,
        }
    }
}

#[async_trait]
impl NotificationJob for EmergencyService {
    fn name(&self) -> &'static str {
        "emergency"
    }

    async fn update(&self, result: &ScanResult) {
        // API-driven individual scans never page anyone.
        if result.result_type == ResultType::Individual || result.matches == 0 {
            return;
        }

        *self
            .matches_per_bucket
            .lock()
            .entry(result.bucket.clone())
            .or_insert(0) += result.matches;
    }

    async fn flush(&self) {
        let drained: HashMap<String, i64> =
            std::mem::take(&mut *self.matches_per_bucket.lock());
        if drained.is_empty() {
            return;
        }

        let mut message = String::from(
            "Malicious artifacts detected in the following buckets, \
             please check the logs for more information:\n",
        );
        let mut buckets: Vec<&String> = drained.keys().collect();
        buckets.sort();
        for bucket in buckets {
            message.push_str(&format!("{bucket} -> {}\n", drained[bucket]));
        }

        let mut delivered = false;
        for viewer in &self.viewers {
            match viewer.send_message(&message).await {
                Ok(()) => delivered = true,
                Err(err) => {
                    tracing::error!(error = %err, "failed to deliver emergency notification");
                }
            }
        }

        if !delivered {
            let mut stats = self.matches_per_bucket.lock();
            for (bucket, count) in drained {
                *stats.entry(bucket).or_insert(0) += count;
            }
        }
    }
}

/// Feeds every result to every notification job.
pub struct NotificationHandler {
    jobs: Vec<Arc<dyn NotificationJob>>,
}

impl NotificationHandler {
    pub fn new(jobs: Vec<Arc<dyn NotificationJob>>) -> Self {
        Self { jobs }
    }

    /// Periodic flusher. On cancellation one final flush runs so counts
    /// gathered since the last tick are not lost on shutdown.
    pub fn spawn_flusher(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let jobs = self.jobs.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("notifying external systems before termination");
                        for job in &jobs {
                            job.flush().await;
                        }
                        return;
                    }
                    _ = ticker.tick() => {
                        for job in &jobs {
                            job.flush().await;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Handler<ScanResult, ()> for NotificationHandler {
    fn name(&self) -> String {
        let jobs: Vec<&str> = self.jobs.iter().map(|job| job.name()).collect();
        format!("notification handler with jobs: {}", jobs.join(", "))
    }

    async fn handle(
        &self,
        request: &mut ScanResult,
        _out: &OutputWriter<()>,
    ) -> anyhow::Result<()> {
        for job in &self.jobs {
            tracing::debug!(job = job.name(), "running job");
            job.update(request).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn aggregate_result(bucket: &str, scanned: i64) -> ScanResult {
        let mut result = ScanResult::new(bucket);
        result.scanned = scanned;
        result
    }

    #[tokio::test]
    async fn test_aggregate_statistics_accumulate_and_flush() {
        let repo = Arc::new(AggregateRepository::new(Arc::new(MemoryCache::new())));
        let stats = AggregateStatistics::new(repo.clone());

        stats.update(&aggregate_result("b", 1)).await;
        stats.update(&aggregate_result("b", 2)).await;
        stats.flush().await;

        let now = chrono::Utc::now();
        let persisted = repo
            .get_by_bucket_and_date("b", now.day(), now.month())
            .await
            .unwrap();
        assert_eq!(persisted.scanned, 3);

        // The accumulator drained.
        assert!(stats.stats.lock().is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_flush_merges_with_persisted_value() {
        let repo = Arc::new(AggregateRepository::new(Arc::new(MemoryCache::new())));
        let stats = AggregateStatistics::new(repo.clone());

        stats.update(&aggregate_result("b", 1)).await;
        stats.flush().await;
        stats.update(&aggregate_result("b", 5)).await;
        stats.flush().await;

        let now = chrono::Utc::now();
        let persisted = repo
            .get_by_bucket_and_date("b", now.day(), now.month())
            .await
            .unwrap();
        assert_eq!(persisted.scanned, 6);
    }

    #[tokio::test]
    async fn test_aggregate_statistics_ignore_individual_results() {
        let repo = Arc::new(AggregateRepository::new(Arc::new(MemoryCache::new())));
        let stats = AggregateStatistics::new(repo);

        let mut result = aggregate_result("b", 1);
        result.result_type = ResultType::Individual;
        stats.update(&result).await;

        assert!(stats.stats.lock().is_empty());
    }

    struct RecordingViewer {
        accept: bool,
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Viewer for RecordingViewer {
        async fn show(
            &self,
            _description: &str,
            _results: &HashMap<String, ScanResult>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_message(&self, message: &str) -> anyhow::Result<()> {
            if !self.accept {
                anyhow::bail!("viewer unavailable");
            }
            self.messages.lock().push(message.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_emergency_notifies_on_matches_and_resets() {
        let viewer = Arc::new(RecordingViewer {
            accept: true,
            messages: Mutex::new(Vec::new()),
        });
        let emergency = EmergencyService::new(vec![viewer.clone()]);

        let mut matched = aggregate_result("infected", 1);
        matched.matches = 2;
        emergency.update(&matched).await;
        emergency.update(&aggregate_result("clean", 1)).await;

        emergency.flush().await;

        let messages = viewer.messages.lock();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("infected -> 2"));
        assert!(!messages[0].contains("clean"));
        drop(messages);

        // Nothing accumulated: the next flush sends nothing.
        emergency.flush().await;
        assert_eq!(viewer.messages.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_emergency_keeps_counts_when_no_viewer_accepts() {
        let rejecting = Arc::new(RecordingViewer {
            accept: false,
            messages: Mutex::new(Vec::new()),
        });
        let emergency = EmergencyService::new(vec![rejecting]);

        let mut matched = aggregate_result("infected", 1);
        matched.matches = 1;
        emergency.update(&matched).await;
        emergency.flush().await;

        assert_eq!(
            emergency.matches_per_bucket.lock().get("infected"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_individual_statistics_persist_by_scan_id() {
        let repo = Arc::new(IndividualRepository::new(Arc::new(MemoryCache::new())));
        let stats = IndividualStatistics::new(repo.clone());

        let mut result = aggregate_result("internal", 1);
        result.scan_id = "scan-9".into();
        result.result_type = ResultType::Individual;
        stats.update(&result).await;

        assert_eq!(repo.get("scan-9").await.unwrap().scanned, 1);

        // Aggregate results are not persisted here.
        let mut other = aggregate_result("bucket", 1);
        other.scan_id = "scan-10".into();
        stats.update(&other).await;
        assert!(repo.get("scan-10").await.is_err());
    }
}
