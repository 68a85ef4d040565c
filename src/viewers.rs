//! Outbound notification channels.
//!
//! Viewers deliver human-readable summaries of scan statistics and
//! emergency alerts. The Slack implementation posts to an incoming
//! webhook; the log viewer stands in where no chat or SMS integration is
//! configured, keeping the delivery path observable in development.

use crate::entities::ScanResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// A delivery channel for textual scan summaries.
#[async_trait]
pub trait Viewer: Send + Sync + 'static {
    /// Deliver a per-bucket statistics table.
    async fn show(&self, description: &str, results: &HashMap<String, ScanResult>) -> Result<()>;

    /// Deliver a short free-form message (emergency alerts).
    async fn send_message(&self, message: &str) -> Result<()>;
}

/// Render per-bucket results the way every text channel displays them.
fn render(description: &str, results: &HashMap<String, ScanResult>) -> String {
    let mut lines = vec![description.to_string()];

    let mut buckets: Vec<&String> = results.keys().collect();
    buckets.sort();

    for bucket in buckets {
        let result = &results[bucket];
        lines.push(format!(
            "{bucket}: scanned {}, bypassed {}, matches {}, errors {}",
            result.scanned, result.bypassed, result.matches, result.errors
        ));
    }
    lines.join("\n")
}

/// Posts messages to a Slack incoming webhook.
pub struct SlackViewer {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackViewer {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            webhook_url: webhook_url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, text: &str) -> Result<()> {
        if self.webhook_url.is_empty() {
            anyhow::bail!("slack webhook not configured");
        }

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .context("failed to post to slack webhook")?;

        if !response.status().is_success() {
            anyhow::bail!("slack webhook answered {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl Viewer for SlackViewer {
    async fn show(&self, description: &str, results: &HashMap<String, ScanResult>) -> Result<()> {
        self.post(&render(description, results)).await
    }

    async fn send_message(&self, message: &str) -> Result<()> {
        self.post(message).await
    }
}

/// Writes summaries to the log. Used where the SMS gateway would sit in a
/// full deployment.
pub struct LogViewer;

#[async_trait]
impl Viewer for LogViewer {
    async fn show(&self, description: &str, results: &HashMap<String, ScanResult>) -> Result<()> {
        tracing::info!(summary = %render(description, results), "scan statistics");
        Ok(())
    }

    async fn send_message(&self, message: &str) -> Result<()> {
        tracing::warn!(%message, "emergency notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_sorts_buckets() {
        let mut results = HashMap::new();
        let mut b = ScanResult::new("b-bucket");
        b.scanned = 2;
        results.insert("b-bucket".to_string(), b);
        results.insert("a-bucket".to_string(), ScanResult::new("a-bucket"));

        let text = render("Scan results", &results);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Scan results");
        assert!(lines[1].starts_with("a-bucket:"));
        assert!(lines[2].starts_with("b-bucket: scanned 2"));
    }

    #[tokio::test]
    async fn test_unconfigured_slack_webhook_fails() {
        let viewer = SlackViewer::new("");
        assert!(viewer.send_message("hello").await.is_err());
    }
}
