//! Bucket-notification queue port and the event ingester.
//!
//! The queue delivers object-store notification envelopes; the ingester
//! decodes them and turns creation events into scan requests. The concrete
//! SQS adapter lives outside this crate; [`MemoryEventQueue`] backs tests
//! and embedded runs.

mod ingest;

pub use ingest::BucketEventIngester;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;

/// One message as received from the notification queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Opaque acknowledgement handle; deleting requires it.
    pub receipt: String,
    pub body: String,
}

/// Notification queue as seen by the scanner core.
#[async_trait]
pub trait EventQueue: Send + Sync + 'static {
    /// Fetch the next batch of messages; empty when nothing is pending.
    async fn receive(&self) -> Result<Vec<QueueMessage>>;

    /// Acknowledge (delete) a message by its receipt handle.
    async fn delete(&self, receipt: &str) -> Result<()>;
}

/// Outer notification envelope: the interesting JSON hides in `Message`.
#[derive(Debug, Deserialize)]
pub(crate) struct NotificationEnvelope {
    #[serde(rename = "Message", default)]
    pub message: String,
}

/// Bucket event batch.
#[derive(Debug, Deserialize)]
pub(crate) struct EventRecords {
    #[serde(rename = "Record", default)]
    pub record: Vec<BucketEvent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BucketEvent {
    #[serde(rename = "awsRegion", default)]
    pub aws_region: String,
    #[serde(rename = "eventName", default)]
    pub event_name: String,
    pub s3: EventStorage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventStorage {
    pub bucket: EventBucket,
    pub object: EventObject,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventBucket {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventObject {
    pub key: String,
    #[serde(default)]
    pub size: u64,
}

/// In-process queue for tests and embedded runs.
#[derive(Default)]
pub struct MemoryEventQueue {
    messages: Mutex<VecDeque<QueueMessage>>,
}

impl MemoryEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw message body.
    pub fn push(&self, receipt: &str, body: &str) {
        self.messages.lock().push_back(QueueMessage {
            receipt: receipt.to_string(),
            body: body.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

#[async_trait]
impl EventQueue for MemoryEventQueue {
    async fn receive(&self) -> Result<Vec<QueueMessage>> {
        Ok(self.messages.lock().drain(..).collect())
    }

    async fn delete(&self, _receipt: &str) -> Result<()> {
        // Receives already removed the message; acknowledging is a no-op.
        Ok(())
    }
}
