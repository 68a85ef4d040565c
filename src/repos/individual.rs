//! Per-scan results, keyed by scan id.

use super::RESULT_TTL;
use crate::cache::Cache;
use crate::entities::ScanResult;
use anyhow::{bail, Context, Result};
use std::sync::Arc;

pub struct IndividualRepository {
    cache: Arc<dyn Cache>,
}

impl IndividualRepository {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn save(&self, result: &ScanResult) -> Result<()> {
        let json = serde_json::to_string(result).context("failed to serialize scan result")?;
        self.cache.set(&result.scan_id, json, Some(RESULT_TTL)).await
    }

    pub async fn get(&self, scan_id: &str) -> Result<ScanResult> {
        match self.cache.get(scan_id).await? {
            Some(json) => serde_json::from_str(&json)
                .with_context(|| format!("corrupt individual entry for {scan_id}")),
            None => bail!("no result stored for scan id {scan_id}"),
        }
    }
}
