//! JSON shapes of the HTTP API.

use crate::entities::ScanResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Response of the scheduling endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ScheduleResponse {
    pub fn ok(id: String) -> Self {
        Self {
            id,
            error: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            error: message.into(),
        }
    }
}

/// Body of `POST /objects`.
#[derive(Debug, Deserialize)]
pub struct RequestObjectScan {
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    #[allow(dead_code)] // Accepted for compatibility; region is resolved server-side.
    pub region: Option<String>,
}

/// One scan result as the API renders it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ScanResponse {
    pub bucket: String,
    pub scanned: i64,
    pub bypassed: i64,
    pub matches: i64,
    pub errors: i64,
    pub entropy: HashMap<String, i64>,
    pub requests: i64,
}

impl From<&ScanResult> for ScanResponse {
    fn from(result: &ScanResult) -> Self {
        Self {
            bucket: result.bucket.clone(),
            scanned: result.scanned,
            bypassed: result.bypassed,
            matches: result.matches,
            errors: result.errors,
            entropy: result.entropy.clone(),
            requests: result.requests,
        }
    }
}

/// Response of the result endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectScanResponse {
    #[serde(default)]
    pub result: HashMap<String, ScanResponse>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ObjectScanResponse {
    pub fn of(results: HashMap<String, ScanResult>) -> Self {
        Self {
            result: results
                .iter()
                .map(|(key, result)| (key.clone(), ScanResponse::from(result)))
                .collect(),
            error: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: HashMap::new(),
            error: message.into(),
        }
    }
}
