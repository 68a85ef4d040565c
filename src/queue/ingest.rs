//! Poll worker turning bucket notifications into scan requests.

use super::{BucketEvent, EventQueue, EventRecords, NotificationEnvelope, QueueMessage};
use crate::entities::{ResultType, ScanRequest};
use crate::filetype;
use crate::metrics;
use crate::storage::SandboxFactory;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pause between polls that returned nothing, so an idle queue does not
/// turn into a busy loop.
const IDLE_PAUSE: Duration = Duration::from_secs(1);

pub struct BucketEventIngester {
    queue: Arc<dyn EventQueue>,
    sandbox_factory: Arc<SandboxFactory>,
    output: mpsc::Sender<ScanRequest>,
}

impl BucketEventIngester {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        sandbox_factory: Arc<SandboxFactory>,
        output: mpsc::Sender<ScanRequest>,
    ) -> Self {
        Self {
            queue,
            sandbox_factory,
            output,
        }
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("start of queue ingestion");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = self.queue.receive() => match received {
                        Ok(messages) if messages.is_empty() => {
                            tokio::select! {
                                _ = token.cancelled() => break,
                                _ = tokio::time::sleep(IDLE_PAUSE) => {}
                            }
                        }
                        Ok(messages) => {
                            for message in messages {
                                self.handle_message(message, &token).await;
                            }
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "failed to obtain scan request");
                            tokio::select! {
                                _ = token.cancelled() => break,
                                _ = tokio::time::sleep(IDLE_PAUSE) => {}
                            }
                        }
                    }
                }
            }

            tracing::info!("end of queue ingestion");
        })
    }

    async fn handle_message(&self, message: QueueMessage, token: &CancellationToken) {
        let events = match extract_events(&message.body) {
            Ok(events) => events,
            Err(err) => {
                tracing::error!(error = %err, "failed to extract events, deleting message");
                if let Err(err) = self.queue.delete(&message.receipt).await {
                    tracing::error!(error = %err, "deleting invalid message failed");
                }
                return;
            }
        };

        for event in events {
            self.submit_event(event, &message.receipt, token).await;
        }
    }

    async fn submit_event(&self, event: BucketEvent, receipt: &str, token: &CancellationToken) {
        if !event.event_name.starts_with("ObjectCreated:") {
            return;
        }

        tracing::debug!(region = %event.aws_region, bucket = %event.s3.bucket.name,
            key = %event.s3.object.key, size = event.s3.object.size,
            "received new request");

        let sandbox = match self.sandbox_factory.acquire(
            event.s3.object.size,
            filetype::is_compressed_filename(&event.s3.object.key),
        ) {
            Ok(sandbox) => sandbox,
            Err(err) => {
                tracing::error!(bucket = %event.s3.bucket.name, key = %event.s3.object.key,
                    error = %err, "failed to create storage for request");
                return;
            }
        };

        let request = ScanRequest {
            scan_id: Uuid::new_v4().to_string(),
            result_type: ResultType::Aggregate,
            bucket: event.s3.bucket.name,
            keys: vec![event.s3.object.key],
            size: event.s3.object.size,
            storage_type: "s3".to_string(),
            storage_id: sandbox.id().to_string(),
            message_id: receipt.to_string(),
            ..ScanRequest::default()
        };

        tokio::select! {
            _ = token.cancelled() => {}
            _ = self.output.send(request) => {
                metrics::EVENTS_CONSUMED.inc();
            }
        }
    }
}

/// Decode the notification envelope. The event batch either hides inside
/// the envelope's `Message` string or, with some emitters, sits directly
/// in the body.
fn extract_events(body: &str) -> Result<Vec<BucketEvent>> {
    let envelope: Option<NotificationEnvelope> = serde_json::from_str(body).ok();

    if let Some(envelope) = envelope {
        if let Ok(records) = serde_json::from_str::<EventRecords>(&envelope.message) {
            return Ok(records.record);
        }
    }

    let records: EventRecords =
        serde_json::from_str(body).context("failed to decode event records")?;
    Ok(records.record)
}
