//! Composition root: builds every service, wires the stages, starts the
//! background workers, and runs the HTTP server until shutdown.

use crate::cache::{Cache, MemoryCache};
use crate::config::Config;
use crate::entities::{ScanRequest, ScanResult};
use crate::external::{ExternalScan, VirusTotalConfig, VirusTotalScanner};
use crate::http::{self, auth::AuthKeys, AppState, MIME_SLACK, MIME_SMS};
use crate::pipeline::cleanup::{CleanupHandler, QueueCleanup, ScheduleCleanup, StorageCleanup};
use crate::pipeline::filter::{
    ApplicationFilter, BypassFilter, FilterHandler, FilterJob, ProbabilisticFilter,
};
use crate::pipeline::notification::{
    AggregateStatistics, EmergencyService, IndividualStatistics, NotificationHandler,
    NotificationJob,
};
use crate::pipeline::preprocess::{
    Decompress, Downloader, IndividualScanUpdate, PostDecryption, PreDecryption, PreprocessHandler,
    PreprocessJob,
};
use crate::pipeline::scan::{ScanHandler, ScanService};
use crate::pipeline::{CleanupMessage, Stage};
use crate::queue::{BucketEventIngester, EventQueue, MemoryEventQueue};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::repos::{AggregateRepository, IndividualRepository, ScheduleQueueRepository};
use crate::scanners::{AsyncScanner, EntropyScanner, ExternalScanScheduler, YaraScanner};
use crate::services::{DecompressService, DownloadService, ScheduleService, StatisticsService};
use crate::storage::{MemoryRemoteStorage, RemoteStorageFactory, SandboxFactory};
use crate::viewers::{LogViewer, SlackViewer, Viewer};
use anyhow::{Context, Result};
use axum::Router;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the pipeline entry and cleanup channels.
const CHANNEL_CAPACITY: usize = 16;

/// Swappable infrastructure. Production wiring registers the real cloud
/// adapters here; tests and single-node runs use the embedded backends.
pub struct Dependencies {
    pub cache: Arc<dyn Cache>,
    pub remote_factory: Arc<RemoteStorageFactory>,
    pub event_queue: Arc<dyn EventQueue>,
    pub external_scanner: Arc<dyn ExternalScan>,
}

impl Dependencies {
    /// Fully in-process wiring: memory cache, memory object store, memory
    /// queue, and the real external-scanner client gated by configuration.
    pub fn embedded(config: &Config) -> Self {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());

        let rate_limiter = RateLimiter::new(
            cache.clone(),
            RateLimitConfig {
                key: "virustotal".to_string(),
                per_minute: config.scanner.external.requests_per_minute,
                per_hour: config.scanner.external.requests_per_hour,
            },
        );
        let external_scanner = Arc::new(VirusTotalScanner::new(
            VirusTotalConfig {
                api_key: config.scanner.external.api_key.clone(),
                detection_threshold: config.scanner.external.detection_threshold,
                ..VirusTotalConfig::default()
            },
            rate_limiter,
        ));

        // The embedded object store emits the creation notifications a real
        // deployment gets from the bucket provider, so uploads flow into
        // the pipeline without external plumbing.
        let event_queue = Arc::new(MemoryEventQueue::new());
        let notifications = event_queue.clone();
        let remote = MemoryRemoteStorage::new().with_store_hook(Arc::new(
            move |bucket: &str, key: &str, size: u64| {
                let records = serde_json::json!({
                    "Record": [{
                        "awsRegion": "local",
                        "eventName": "ObjectCreated:Put",
                        "s3": {
                            "bucket": { "name": bucket },
                            "object": { "key": key, "size": size },
                        },
                    }],
                })
                .to_string();
                let body = serde_json::json!({ "Message": records }).to_string();
                notifications.push(&uuid::Uuid::new_v4().to_string(), &body);
            },
        ));

        Self {
            cache,
            remote_factory: Arc::new(
                RemoteStorageFactory::new().register("s3", Arc::new(remote)),
            ),
            event_queue,
            external_scanner,
        }
    }
}

/// A fully wired scanner: router plus running background workers.
pub struct App {
    pub router: Router,
    pub token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl App {
    pub fn build(config: &Config, deps: Dependencies) -> Result<Self> {
        let token = CancellationToken::new();

        let sandbox_factory = Arc::new(SandboxFactory::new(config.scanner.max_storage_bytes));
        let download = Arc::new(DownloadService::new(
            sandbox_factory.clone(),
            deps.remote_factory.clone(),
        ));
        let schedule = Arc::new(ScheduleService::new(
            deps.remote_factory.clone(),
            deps.cache.clone(),
            &config.scanner.internal_bucket,
        ));
        let decompress = Arc::new(DecompressService::new());

        let aggregate_repo = Arc::new(AggregateRepository::new(deps.cache.clone()));
        let individual_repo = Arc::new(IndividualRepository::new(deps.cache.clone()));
        let schedule_queue_repo = Arc::new(ScheduleQueueRepository::new(
            deps.cache.clone(),
            &config.scanner.external.wait_list,
        ));

        // Viewers
        let mut viewers: HashMap<String, Arc<dyn Viewer>> = HashMap::new();
        let mut emergency_viewers: Vec<Arc<dyn Viewer>> = Vec::new();
        if !config.notification.slack_webhook.is_empty() {
            let slack: Arc<dyn Viewer> =
                Arc::new(SlackViewer::new(&config.notification.slack_webhook));
            viewers.insert(MIME_SLACK.to_string(), slack.clone());
            emergency_viewers.push(slack);
        }
        let log_viewer: Arc<dyn Viewer> = Arc::new(LogViewer);
        viewers.insert(MIME_SMS.to_string(), log_viewer.clone());
        emergency_viewers.push(log_viewer);

        // Channels
        let (input_tx, input_rx) = mpsc::channel::<ScanRequest>(CHANNEL_CAPACITY);
        let (cleanup_tx, cleanup_rx) =
            mpsc::channel::<CleanupMessage<ScanRequest>>(CHANNEL_CAPACITY);

        // Filters
        let filter_jobs: Vec<Arc<dyn FilterJob>> = vec![
            Arc::new(ApplicationFilter::new(
                download.clone(),
                sandbox_factory.clone(),
            )),
            Arc::new(ProbabilisticFilter::new(
                config.scanner.scan_probabilities.clone(),
            )),
            Arc::new(BypassFilter::new(
                config.scanner.allowlist.clone(),
                config.scanner.size_limit,
            )),
        ];
        let filter_handler = Arc::new(FilterHandler::new(filter_jobs));

        // Pre-processors
        let preprocess_jobs: Vec<Arc<dyn PreprocessJob>> = vec![
            Arc::new(Downloader::new(download.clone())),
            Arc::new(PreDecryption::new()),
            Arc::new(PostDecryption::new(
                sandbox_factory.clone(),
                &config.scanner.cipher_kek,
            )),
            Arc::new(Decompress::new(decompress, sandbox_factory.clone())),
            Arc::new(IndividualScanUpdate::new(schedule.clone())),
        ];
        let preprocess_handler = Arc::new(PreprocessHandler::new(preprocess_jobs));

        // Scanners
        let yara_dir = (!config.scanner.yara_rules_dir.is_empty())
            .then(|| Path::new(&config.scanner.yara_rules_dir));
        let yara = Arc::new(
            YaraScanner::new(yara_dir).context("failed to initialize yara scanner")?,
        );
        let collect_interval =
            Duration::from_secs(config.scanner.external.collect_interval_secs);
        let external_scheduler: Arc<dyn AsyncScanner> = Arc::new(ExternalScanScheduler::new(
            deps.external_scanner.clone(),
            schedule_queue_repo,
            collect_interval,
        ));

        let scan_service = Arc::new(ScanService::new(
            sandbox_factory.clone(),
            vec![Arc::new(EntropyScanner::new()), yara],
            vec![external_scheduler.clone()],
        ));
        let scan_handler = Arc::new(ScanHandler::new(
            scan_service,
            vec![external_scheduler],
            collect_interval,
        ));

        // Notifications
        let notification_jobs: Vec<Arc<dyn NotificationJob>> = vec![
            Arc::new(AggregateStatistics::new(aggregate_repo.clone())),
            Arc::new(EmergencyService::new(emergency_viewers)),
            Arc::new(IndividualStatistics::new(individual_repo.clone())),
        ];
        let notification_handler = Arc::new(NotificationHandler::new(notification_jobs));

        // Cleanups
        let cleanup_jobs: Vec<Arc<dyn crate::pipeline::cleanup::CleanupJob>> = vec![
            Arc::new(QueueCleanup::new(deps.event_queue.clone())),
            Arc::new(StorageCleanup::new(sandbox_factory.clone())),
            Arc::new(ScheduleCleanup::new(schedule.clone())),
        ];
        let cleanup_handler = Arc::new(CleanupHandler::new(cleanup_jobs));

        // Stages
        let mut filter_stage = Stage::<ScanRequest, ScanRequest>::new(
            filter_handler,
            input_rx,
            cleanup_tx.clone(),
            token.clone(),
        );
        let mut preprocess_stage = Stage::<ScanRequest, ScanRequest>::new(
            preprocess_handler,
            filter_stage.take_output(),
            cleanup_tx.clone(),
            token.clone(),
        );
        let mut scan_stage = Stage::<ScanRequest, ScanResult>::new(
            scan_handler.clone(),
            preprocess_stage.take_output(),
            cleanup_tx.clone(),
            token.clone(),
        );

        // The collector injects synthetic results into the same channel the
        // scan stage feeds the notification stage with.
        let notification_input = scan_stage.output_sender();
        let (result_cleanup_tx, _) = mpsc::channel::<CleanupMessage<ScanResult>>(1);
        let notification_stage = Stage::<ScanResult, ()>::new(
            notification_handler.clone(),
            scan_stage.take_output(),
            result_cleanup_tx,
            token.clone(),
        );

        let (noop_cleanup_tx, _) =
            mpsc::channel::<CleanupMessage<CleanupMessage<ScanRequest>>>(1);
        let cleanup_stage = Stage::<CleanupMessage<ScanRequest>, ()>::new(
            cleanup_handler,
            cleanup_rx,
            noop_cleanup_tx,
            token.clone(),
        );

        let mut workers = vec![
            filter_stage.spawn(),
            preprocess_stage.spawn(),
            scan_stage.spawn(),
            notification_stage.spawn(),
            cleanup_stage.spawn(),
            scan_handler.spawn_result_collector(notification_input, token.clone()),
            notification_handler.spawn_flusher(
                Duration::from_secs(config.notification.update_interval_secs),
                token.clone(),
            ),
        ];

        // Queue ingestion
        let ingester = BucketEventIngester::new(
            deps.event_queue.clone(),
            sandbox_factory.clone(),
            input_tx,
        );
        workers.push(ingester.spawn(token.clone()));

        // HTTP surface
        let statistics = Arc::new(StatisticsService::new(
            aggregate_repo,
            individual_repo,
            schedule.clone(),
            viewers,
        ));
        let state = Arc::new(AppState {
            schedule,
            statistics,
            cache: deps.cache.clone(),
            auth: AuthKeys::parse(&config.server.authorization_keys)
                .context("invalid authorization keys")?,
        });
        let router = http::router(state, config.server.max_request_size);

        Ok(Self {
            router,
            token,
            workers,
        })
    }

    /// Cancel every worker and wait for them to drain. The notification
    /// flusher performs its final flush during this call.
    pub async fn shutdown(self) {
        self.token.cancel();
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "worker did not shut down cleanly");
            }
        }
    }
}

/// Run the scanner until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    let deps = Dependencies::embedded(&config);
    let app = App::build(&config, deps)?;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.server.port))?;
    tracing::info!(port = config.server.port, "scanner listening");

    let shutdown_token = app.token.clone();
    axum::serve(listener, app.router.clone())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown_token.cancel();
        })
        .await
        .context("http server failed")?;

    app.shutdown().await;
    Ok(())
}
