//! VirusTotal v3 client.
//!
//! Every call passes the shared rate limiter first; a rejected call becomes
//! an [`Outcome::Error`] without touching the network. Binary submissions
//! pick their upload endpoint by size: small files go straight to `/files`,
//! mid-sized ones fetch a one-shot upload URL, and anything above the hard
//! limit is refused locally.

use super::{classify, ExternalScan, Outcome, QueryStatus};
use crate::ratelimit::RateLimiter;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;

const SMALL_FILE_LIMIT: usize = 32 * 1024 * 1024;
const HARD_FILE_LIMIT: usize = 500 * 1024 * 1024;

/// Client configuration. An empty `api_key` marks the scanner unavailable.
#[derive(Debug, Clone)]
pub struct VirusTotalConfig {
    pub api_key: String,
    /// Detection percentage strictly above which a verdict is malicious.
    pub detection_threshold: f64,
    /// API base, overridable for tests. Default `https://www.virustotal.com`.
    pub base_url: String,
}

impl Default for VirusTotalConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            detection_threshold: 10.0,
            base_url: "https://www.virustotal.com".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnalysisStats {
    #[serde(default)]
    malicious: u64,
    #[serde(default)]
    undetected: u64,
}

#[derive(Debug, Default, Deserialize)]
struct Attributes {
    #[serde(default)]
    status: String,
    #[serde(default)]
    stats: Option<AnalysisStats>,
    #[serde(default)]
    last_analysis_stats: Option<AnalysisStats>,
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    id: String,
    #[serde(default)]
    attributes: Option<Attributes>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Payload,
}

#[derive(Debug, Deserialize)]
struct UploadUrl {
    data: String,
}

pub struct VirusTotalScanner {
    config: VirusTotalConfig,
    rate_limiter: RateLimiter,
    client: reqwest::Client,
}

impl VirusTotalScanner {
    pub fn new(config: VirusTotalConfig, rate_limiter: RateLimiter) -> Self {
        Self {
            config,
            rate_limiter,
            client: reqwest::Client::new(),
        }
    }

    async fn get_json(&self, url: &str) -> Result<Envelope, QueryStatus> {
        let response = self
            .client
            .get(url)
            .header("accept", "application/json")
            .header("x-apikey", &self.config.api_key)
            .send()
            .await
            .map_err(|err| QueryStatus::error(format!("request failed: {err}")))?;

        if !response.status().is_success() {
            return Err(QueryStatus::error(format!(
                "call failed with status {}",
                response.status()
            )));
        }

        response.json::<Envelope>().await.map_err(|err| QueryStatus {
            id: String::new(),
            outcome: Outcome::DecodeError,
            detail: Some(format!("failed to decode response: {err}")),
        })
    }

    async fn upload_url(&self, filesize: usize) -> Result<String, QueryStatus> {
        if filesize < SMALL_FILE_LIMIT {
            return Ok(format!("{}/api/v3/files", self.config.base_url));
        }

        if filesize > HARD_FILE_LIMIT {
            return Err(QueryStatus::error("above max entity size"));
        }

        if !self.rate_limiter.is_allowed().await {
            return Err(QueryStatus::error("too many requests"));
        }

        let response = self
            .client
            .get(format!("{}/api/v3/files/upload_url", self.config.base_url))
            .header("accept", "application/json")
            .header("x-apikey", &self.config.api_key)
            .send()
            .await
            .map_err(|err| QueryStatus::error(format!("failed to obtain upload url: {err}")))?;

        if !response.status().is_success() {
            return Err(QueryStatus::error(format!(
                "upload url call failed with status {}",
                response.status()
            )));
        }

        response
            .json::<UploadUrl>()
            .await
            .map(|wrapper| wrapper.data)
            .map_err(|err| QueryStatus {
                id: String::new(),
                outcome: Outcome::DecodeError,
                detail: Some(format!("failed to decode upload url: {err}")),
            })
    }

    fn verdict(&self, payload: Payload) -> QueryStatus {
        let attributes = payload.attributes.unwrap_or_default();
        if attributes.status == "queued" {
            return QueryStatus::of(payload.id, Outcome::InProgress);
        }

        let stats = attributes
            .stats
            .or(attributes.last_analysis_stats)
            .unwrap_or(AnalysisStats {
                malicious: 0,
                undetected: 0,
            });

        QueryStatus::of(
            payload.id,
            classify(
                stats.malicious,
                stats.undetected,
                self.config.detection_threshold,
            ),
        )
    }
}

#[async_trait]
impl ExternalScan for VirusTotalScanner {
    fn is_available(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    async fn scan_hash(&self, hash: &str) -> QueryStatus {
        if !self.rate_limiter.is_allowed().await {
            return QueryStatus::error("too many requests");
        }

        let url = format!("{}/api/v3/files/{hash}", self.config.base_url);
        match self.get_json(&url).await {
            Ok(envelope) => self.verdict(envelope.data),
            Err(status) => status,
        }
    }

    async fn scan_binary(&self, data: &[u8]) -> QueryStatus {
        let url = match self.upload_url(data.len()).await {
            Ok(url) => url,
            Err(status) => return status,
        };

        if !self.rate_limiter.is_allowed().await {
            return QueryStatus::error("too many requests");
        }

        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name("filename");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = match self
            .client
            .post(&url)
            .header("accept", "application/json")
            .header("x-apikey", &self.config.api_key)
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return QueryStatus::error(format!("upload failed: {err}")),
        };

        if !response.status().is_success() {
            return QueryStatus::error(format!(
                "upload failed with status {}",
                response.status()
            ));
        }

        let envelope: Envelope = match response.json().await {
            Ok(envelope) => envelope,
            Err(err) => {
                return QueryStatus {
                    id: String::new(),
                    outcome: Outcome::DecodeError,
                    detail: Some(format!("failed to decode upload response: {err}")),
                }
            }
        };

        // The service sometimes reports success with an id that is not
        // valid base64; such a handle can never be polled.
        if BASE64.decode(&envelope.data.id).is_err() {
            return QueryStatus {
                id: String::new(),
                outcome: Outcome::InvalidId,
                detail: Some(format!("service returned invalid id {}", envelope.data.id)),
            };
        }

        QueryStatus::of(envelope.data.id, Outcome::InProgress)
    }

    async fn get_scan_result(&self, id: &str) -> QueryStatus {
        if !self.rate_limiter.is_allowed().await {
            return QueryStatus::error("too many requests");
        }

        let url = format!("{}/api/v3/analyses/{id}", self.config.base_url);
        match self.get_json(&url).await {
            Ok(envelope) => self.verdict(envelope.data),
            Err(status) => status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::ratelimit::RateLimitConfig;
    use std::sync::Arc;

    fn scanner(api_key: &str, per_minute: u64) -> VirusTotalScanner {
        let limiter = RateLimiter::new(
            Arc::new(MemoryCache::new()),
            RateLimitConfig {
                key: "vt-test".into(),
                per_minute,
                per_hour: 0,
            },
        );
        VirusTotalScanner::new(
            VirusTotalConfig {
                api_key: api_key.to_string(),
                ..VirusTotalConfig::default()
            },
            limiter,
        )
    }

    #[test]
    fn test_availability_follows_api_key() {
        assert!(!scanner("", 0).is_available());
        assert!(scanner("key", 0).is_available());
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_an_error_without_network() {
        let scanner = scanner("key", 1);
        assert!(scanner.rate_limiter.is_allowed().await);

        let status = scanner.scan_hash("abc").await;
        assert_eq!(status.outcome, Outcome::Error);
        assert!(status.detail.unwrap().contains("too many requests"));
    }

    #[tokio::test]
    async fn test_oversized_binary_rejected_locally() {
        let scanner = scanner("key", 0);
        let status = scanner.upload_url(HARD_FILE_LIMIT + 1).await.unwrap_err();
        assert_eq!(status.outcome, Outcome::Error);
        assert!(status.detail.unwrap().contains("max entity size"));
    }

    #[tokio::test]
    async fn test_small_binary_uses_direct_endpoint() {
        let scanner = scanner("key", 0);
        let url = scanner.upload_url(1024).await.unwrap();
        assert!(url.ends_with("/api/v3/files"));
    }

    #[test]
    fn test_queued_analysis_is_in_progress() {
        let scanner = scanner("key", 0);
        let status = scanner.verdict(Payload {
            id: "Q0FGRQ==".into(),
            attributes: Some(Attributes {
                status: "queued".into(),
                stats: None,
                last_analysis_stats: None,
            }),
        });
        assert_eq!(status.outcome, Outcome::InProgress);
        assert_eq!(status.id, "Q0FGRQ==");
    }

    #[test]
    fn test_completed_analysis_classified() {
        let scanner = scanner("key", 0);
        let status = scanner.verdict(Payload {
            id: "Q0FGRQ==".into(),
            attributes: Some(Attributes {
                status: "completed".into(),
                stats: Some(AnalysisStats {
                    malicious: 10,
                    undetected: 0,
                }),
                last_analysis_stats: None,
            }),
        });
        assert_eq!(status.outcome, Outcome::Malicious);
    }
}
