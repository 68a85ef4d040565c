//! Result endpoints: per-scan lookups and per-bucket aggregates.

use super::types::{ObjectScanResponse, ScanResponse};
use super::{AppState, MIME_JSON, MIME_SLACK, MIME_SMS};
use crate::error::Error;
use crate::services::Period;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct AggregateQuery {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub period: String,
}

fn parse_date(raw: &str) -> Result<DateTime<Utc>, Error> {
    if raw.is_empty() {
        return Ok(Utc::now());
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|date| {
            date.and_hms_opt(0, 0, 0)
                .expect("midnight is always valid")
                .and_utc()
        })
        .map_err(|_| Error::Validation(format!("invalid date '{raw}', expected YYYY-MM-DD")))
}

/// `GET /v1/objects?bucket=&date=&period=` with content negotiation: the
/// vendor MIME types deliver through a side channel and answer with an
/// empty body.
pub async fn get_aggregate_result(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AggregateQuery>,
    headers: HeaderMap,
) -> (StatusCode, Json<ObjectScanResponse>) {
    let date = match parse_date(&query.date) {
        Ok(date) => date,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ObjectScanResponse::error(err.to_string())),
            )
        }
    };

    let period = match Period::parse(&query.period) {
        Ok(period) => period,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ObjectScanResponse::error(err.to_string())),
            )
        }
    };

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    match accept {
        "" | "*/*" | MIME_JSON => {
            match state
                .statistics
                .get_buckets_statistics(&query.bucket, date, period)
                .await
            {
                Ok(results) => (StatusCode::OK, Json(ObjectScanResponse::of(results))),
                Err(err) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ObjectScanResponse::error(err.to_string())),
                ),
            }
        }
        MIME_SMS | MIME_SLACK => {
            state
                .statistics
                .show(accept, &query.bucket, date, period)
                .await;
            (StatusCode::OK, Json(ObjectScanResponse::default()))
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(ObjectScanResponse::error("unsupported accept type")),
        ),
    }
}

/// `GET /v1/files/{id}`.
pub async fn get_file_result(
    state: State<Arc<AppState>>,
    id: Path<String>,
) -> (StatusCode, Json<ObjectScanResponse>) {
    get_individual_result(state, id).await
}

/// `GET /v1/objects/{id}`.
pub async fn get_object_result(
    state: State<Arc<AppState>>,
    id: Path<String>,
) -> (StatusCode, Json<ObjectScanResponse>) {
    get_individual_result(state, id).await
}

async fn get_individual_result(
    State(state): State<Arc<AppState>>,
    Path(scan_id): Path<String>,
) -> (StatusCode, Json<ObjectScanResponse>) {
    if Uuid::parse_str(&scan_id).is_err() {
        let err = Error::InvalidScanId(scan_id);
        return (
            StatusCode::BAD_REQUEST,
            Json(ObjectScanResponse::error(err.to_string())),
        );
    }

    match state.statistics.get_scan_result(&scan_id).await {
        Ok(result) => {
            let response = HashMap::from([(scan_id, ScanResponse::from(&result))]);
            (
                StatusCode::OK,
                Json(ObjectScanResponse {
                    result: response,
                    error: String::new(),
                }),
            )
        }
        Err(err) => {
            let status =
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(ObjectScanResponse::error(err.to_string())))
        }
    }
}
