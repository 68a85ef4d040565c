//! End-to-end pipeline tests over the embedded backends: events go in
//! through the memory queue, results come out of the cache-backed
//! repositories.

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use eagle_eye::app::{App, Dependencies};
use eagle_eye::cache::MemoryCache;
use eagle_eye::config::Config;
use eagle_eye::entities::ScanResult;
use eagle_eye::external::{ExternalScan, Outcome, QueryStatus};
use eagle_eye::queue::MemoryEventQueue;
use eagle_eye::repos::AggregateRepository;
use eagle_eye::storage::{MemoryRemoteStorage, RemoteStorage, RemoteStorageFactory};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    remote: Arc<MemoryRemoteStorage>,
    queue: Arc<MemoryEventQueue>,
    cache: Arc<MemoryCache>,
    app: App,
}

/// External scanner whose submission always enters analysis and whose poll
/// always answers with the scripted verdict.
struct ScriptedScanner {
    verdict: Outcome,
}

#[async_trait]
impl ExternalScan for ScriptedScanner {
    fn is_available(&self) -> bool {
        true
    }

    async fn scan_hash(&self, _hash: &str) -> QueryStatus {
        QueryStatus::error("not used")
    }

    async fn scan_binary(&self, _data: &[u8]) -> QueryStatus {
        QueryStatus::of("Q0FGRQ==", Outcome::InProgress)
    }

    async fn get_scan_result(&self, _id: &str) -> QueryStatus {
        QueryStatus::of("Q0FGRQ==", self.verdict)
    }
}

fn build_harness(external: Option<Arc<dyn ExternalScan>>) -> Harness {
    let mut config = Config::default();
    config.notification.update_interval_secs = 1;
    config.scanner.external.collect_interval_secs = 1;

    let cache = Arc::new(MemoryCache::new());
    let remote = Arc::new(MemoryRemoteStorage::new());
    let queue = Arc::new(MemoryEventQueue::new());

    let deps = Dependencies {
        cache: cache.clone(),
        remote_factory: Arc::new(RemoteStorageFactory::new().register("s3", remote.clone())),
        event_queue: queue.clone(),
        external_scanner: external.unwrap_or_else(|| {
            // Empty API key: external scanning disabled.
            let embedded = Dependencies::embedded(&Config::default());
            embedded.external_scanner
        }),
    };

    let app = App::build(&config, deps).expect("failed to build app");
    Harness {
        remote,
        queue,
        cache,
        app,
    }
}

fn object_created_event(bucket: &str, key: &str, size: u64) -> String {
    let records = serde_json::json!({
        "Record": [{
            "awsRegion": "us-east-1",
            "eventName": "ObjectCreated:Put",
            "s3": {
                "bucket": { "name": bucket },
                "object": { "key": key, "size": size },
            },
        }],
    })
    .to_string();
    serde_json::json!({ "Message": records }).to_string()
}

async fn wait_for_aggregate<F>(cache: Arc<MemoryCache>, bucket: &str, check: F) -> ScanResult
where
    F: Fn(&ScanResult) -> bool,
{
    let repo = AggregateRepository::new(cache);
    let now = Utc::now();

    for _ in 0..100 {
        if let Ok(results) = repo.get_by_date(now.day(), now.month()).await {
            if let Some(result) = results.get(bucket) {
                if check(result) {
                    return result.clone();
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("aggregate result for bucket '{bucket}' never appeared");
}

#[tokio::test]
async fn test_text_object_is_scanned_and_aggregated() {
    let harness = build_harness(None);

    let content = b"a small plain text file with ordinary words inside it".to_vec();
    harness
        .remote
        .store("samples", "docs/notes.txt", content.clone())
        .await
        .unwrap();
    harness.queue.push(
        "receipt-1",
        &object_created_event("samples", "docs/notes.txt", content.len() as u64),
    );

    let result = wait_for_aggregate(harness.cache.clone(), "samples", |r| r.requests >= 1).await;
    assert_eq!(result.scanned, 1);
    assert_eq!(result.bypassed, 0);
    assert_eq!(result.errors, 0);
    assert_eq!(result.matches, 0);
    assert_eq!(result.entropy.values().sum::<i64>(), 1);

    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_multimedia_object_is_bypassed() {
    let harness = build_harness(None);

    // A JPEG header followed by filler: classified multimedia, never scanned.
    let mut content = vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10];
    content.extend(std::iter::repeat(0xab).take(100 * 1024));

    harness
        .remote
        .store("samples", "photo.jpeg", content.clone())
        .await
        .unwrap();
    harness.queue.push(
        "receipt-1",
        &object_created_event("samples", "photo.jpeg", content.len() as u64),
    );

    let result = wait_for_aggregate(harness.cache.clone(), "samples", |r| r.requests >= 1).await;
    assert_eq!(result.scanned, 0);
    assert_eq!(result.bypassed, 1);
    assert_eq!(result.errors, 0);
    assert_eq!(result.entropy.values().sum::<i64>(), 0);

    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_nested_zip_reaches_leaf_file() {
    let harness = build_harness(None);

    // nested.zip -> inner.gz -> plain text: one leaf, one sync scan.
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(b"the leaf file inside two containers")
        .unwrap();
    let inner = gz.finish().unwrap();

    let mut zip_writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    zip_writer
        .start_file("inner.gz", zip::write::SimpleFileOptions::default())
        .unwrap();
    zip_writer.write_all(&inner).unwrap();
    let content = zip_writer.finish().unwrap().into_inner();

    harness
        .remote
        .store("samples", "nested.zip", content.clone())
        .await
        .unwrap();
    harness.queue.push(
        "receipt-1",
        &object_created_event("samples", "nested.zip", content.len() as u64),
    );

    let result = wait_for_aggregate(harness.cache.clone(), "samples", |r| r.requests >= 1).await;
    assert_eq!(result.scanned, 1);
    assert_eq!(result.errors, 0);
    assert_eq!(result.bypassed, 0);

    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_malicious_external_verdict_becomes_a_match() {
    let harness = build_harness(Some(Arc::new(ScriptedScanner {
        verdict: Outcome::Malicious,
    })));

    let mut content = b"\x7fELF\x02\x01\x01\x00".to_vec();
    content.extend_from_slice(b"fake binary body");

    harness
        .remote
        .store("samples", "tool.bin", content.clone())
        .await
        .unwrap();
    harness.queue.push(
        "receipt-1",
        &object_created_event("samples", "tool.bin", content.len() as u64),
    );

    // The synthetic result arrives one collector tick after the scan.
    let result =
        wait_for_aggregate(harness.cache.clone(), "samples", |r| r.matches >= 1).await;
    assert!(result.matches >= 1);

    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_oversized_object_is_filtered_out() {
    let harness = build_harness(None);

    harness
        .remote
        .store("samples", "big.bin", vec![0u8; 128])
        .await
        .unwrap();
    // The advertised size (not the real one) drives the bypass filter.
    harness.queue.push(
        "receipt-1",
        &object_created_event("samples", "big.bin", u64::MAX),
    );

    // A second, normal object proves the pipeline still works afterwards.
    harness
        .remote
        .store("samples", "small.txt", b"ordinary".to_vec())
        .await
        .unwrap();
    harness.queue.push(
        "receipt-2",
        &object_created_event("samples", "small.txt", 8),
    );

    let result = wait_for_aggregate(harness.cache.clone(), "samples", |r| r.requests >= 1).await;
    // Only the small file produced a result; the oversized one was aborted
    // before the scan stage.
    assert_eq!(result.requests, 1);
    assert_eq!(result.scanned, 1);

    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_aggregate_accumulates_across_requests() {
    let harness = build_harness(None);

    for index in 0..3 {
        let key = format!("file-{index}.txt");
        harness
            .remote
            .store("samples", &key, b"some text content".to_vec())
            .await
            .unwrap();
        harness.queue.push(
            &format!("receipt-{index}"),
            &object_created_event("samples", &key, 17),
        );
    }

    let result =
        wait_for_aggregate(harness.cache.clone(), "samples", |r| r.requests >= 3).await;
    assert_eq!(result.scanned, 3);
    assert_eq!(result.requests, 3);
    assert_eq!(result.entropy.values().sum::<i64>(), 3);

    harness.app.shutdown().await;
}
