//! Read side of the scan results: per-scan lookups for the API and
//! per-bucket aggregates for reports and viewer dispatch.

use crate::entities::{ScanResult, ScheduleStatus, NO_BUCKET};
use crate::error::Error;
use crate::repos::{AggregateRepository, IndividualRepository};
use crate::services::ScheduleService;
use crate::viewers::Viewer;
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Reporting window of an aggregate query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Day,
    Month,
}

impl Period {
    /// Parse the `period` query parameter; empty means a single day.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        match raw {
            "" | "day" => Ok(Self::Day),
            "month" => Ok(Self::Month),
            other => Err(Error::Validation(format!("invalid period '{other}'"))),
        }
    }
}

pub struct StatisticsService {
    aggregate: Arc<AggregateRepository>,
    individual: Arc<IndividualRepository>,
    schedule: Arc<ScheduleService>,
    viewers: HashMap<String, Arc<dyn Viewer>>,
}

impl StatisticsService {
    pub fn new(
        aggregate: Arc<AggregateRepository>,
        individual: Arc<IndividualRepository>,
        schedule: Arc<ScheduleService>,
        viewers: HashMap<String, Arc<dyn Viewer>>,
    ) -> Self {
        Self {
            aggregate,
            individual,
            schedule,
            viewers,
        }
    }

    /// Result of one user-scheduled scan, mapped through its lifecycle:
    /// only a Completed record has a readable result.
    pub async fn get_scan_result(&self, scan_id: &str) -> Result<ScanResult, Error> {
        let item = self
            .schedule
            .get(scan_id)
            .await
            .map_err(|err| {
                tracing::error!(scan_id, error = %err, "failed to read schedule record");
                Error::ScanNotFound(scan_id.to_string())
            })?
            .ok_or_else(|| Error::ScanNotFound(scan_id.to_string()))?;

        match item.status {
            ScheduleStatus::Waiting => Err(Error::ScanWaiting),
            ScheduleStatus::Running => Err(Error::ScanInProgress),
            ScheduleStatus::Error => Err(Error::ScanFailed),
            ScheduleStatus::Completed => {
                let mut result = self.individual.get(scan_id).await.map_err(|err| {
                    tracing::error!(scan_id, error = %err, "failed to read individual result");
                    Error::ScanNotFound(scan_id.to_string())
                })?;
                result.bucket = NO_BUCKET.to_string();
                Ok(result)
            }
        }
    }

    /// Aggregated statistics of one period, optionally restricted to a
    /// single bucket. An unknown bucket on a non-empty period is an error,
    /// matching the API contract.
    pub async fn get_buckets_statistics(
        &self,
        bucket: &str,
        date: DateTime<Utc>,
        period: Period,
    ) -> anyhow::Result<HashMap<String, ScanResult>> {
        let results = match period {
            Period::Day => self.aggregate.get_by_date(date.day(), date.month()).await?,
            Period::Month => self.aggregate.get_by_month(date.month()).await?,
        };

        if bucket.is_empty() {
            return Ok(results);
        }

        match results.get(bucket) {
            Some(result) => Ok(HashMap::from([(bucket.to_string(), result.clone())])),
            None => anyhow::bail!("no results for bucket {bucket} in the requested period"),
        }
    }

    /// Deliver statistics through the viewer registered for a vendor MIME
    /// type. Delivery failures are logged; the HTTP caller already got its
    /// 200 by the time the viewer runs.
    pub async fn show(&self, mime: &str, bucket: &str, date: DateTime<Utc>, period: Period) {
        let description = match period {
            Period::Day => format!("Scan results {}", date.format("%d-%m-%Y")),
            Period::Month => format!("Scan results {}", date.format("%b %Y")),
        };

        let results = match self.get_buckets_statistics(bucket, date, period).await {
            Ok(results) => results,
            Err(err) => {
                tracing::error!(error = %err, "failed to get bucket statistics");
                return;
            }
        };

        let Some(viewer) = self.viewers.get(mime) else {
            tracing::error!(mime, "no viewer registered for mimetype");
            return;
        };

        if let Err(err) = viewer.show(&description, &results).await {
            tracing::error!(mime, error = %err, "failed to deliver statistics");
        }
    }
}
