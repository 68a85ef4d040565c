//! External analysis service port.
//!
//! The scan stage schedules executables for deep analysis with a remote
//! service and collects verdicts later. The port keeps the pipeline
//! ignorant of the concrete provider; [`virustotal`] implements it against
//! the VirusTotal v3 API.

mod virustotal;

pub use virustotal::{VirusTotalConfig, VirusTotalScanner};

use async_trait::async_trait;

/// Outcome of one interaction with the external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Transport or service failure, including an exhausted request budget.
    Error,
    Benign,
    Malicious,
    /// The service has never seen this artifact.
    Unseen,
    /// Analysis accepted but not finished; poll again later.
    InProgress,
    /// The service answered with a body this client cannot decode.
    DecodeError,
    /// The service returned a submission id that is not valid base64. The
    /// upstream occasionally does this while still reporting success.
    InvalidId,
}

/// Verdict of a query, with the handle to poll when analysis is pending.
#[derive(Debug, Clone)]
pub struct QueryStatus {
    pub id: String,
    pub outcome: Outcome,
    pub detail: Option<String>,
}

impl QueryStatus {
    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            outcome: Outcome::Error,
            detail: Some(detail.into()),
        }
    }

    pub fn of(id: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            id: id.into(),
            outcome,
            detail: None,
        }
    }
}

/// Remote analysis service.
#[async_trait]
pub trait ExternalScan: Send + Sync + 'static {
    /// Whether the client is configured well enough to be used at all.
    fn is_available(&self) -> bool;

    /// Look up a verdict by artifact hash.
    async fn scan_hash(&self, hash: &str) -> QueryStatus;

    /// Submit raw bytes for analysis. On success the outcome is
    /// [`Outcome::InProgress`] and the id is the polling handle.
    async fn scan_binary(&self, data: &[u8]) -> QueryStatus;

    /// Poll a previously submitted analysis.
    async fn get_scan_result(&self, id: &str) -> QueryStatus;
}

/// Detection ratio mapped against a threshold: strictly above is malicious.
/// The `+1` keeps an artifact nobody has analyzed from dividing by zero.
pub(crate) fn classify(malicious: u64, undetected: u64, threshold: f64) -> Outcome {
    let rate = 100.0 * malicious as f64 / (malicious + undetected + 1) as f64;
    if rate > threshold {
        Outcome::Malicious
    } else {
        Outcome::Benign
    }
}
