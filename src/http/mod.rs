//! HTTP surface of the scanner.
//!
//! A versioned API for scheduling scans and reading results, plus the
//! unauthenticated health and metrics endpoints. Authentication, when
//! configured, is bearer tokens checked against stored SHA-256 digests.

pub mod auth;
mod scan;
mod statistics;
pub mod types;

use crate::cache::Cache;
use crate::metrics;
use crate::services::{ScheduleService, StatisticsService};
use auth::AuthKeys;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

/// Vendor MIME types triggering side-channel delivery of aggregates.
pub const MIME_SMS: &str = "application/vnd.eagleeye.scanner.sms.v1";
pub const MIME_SLACK: &str = "application/vnd.eagleeye.scanner.slack.v1";
pub const MIME_JSON: &str = "application/json";

pub struct AppState {
    pub schedule: Arc<ScheduleService>,
    pub statistics: Arc<StatisticsService>,
    pub cache: Arc<dyn Cache>,
    pub auth: Option<AuthKeys>,
}

/// Build the router with every endpoint wired.
pub fn router(state: Arc<AppState>, max_request_size: usize) -> Router {
    Router::new()
        .route("/v1/files", post(scan::scan_file))
        .route(
            "/v1/objects",
            post(scan::scan_object).get(statistics::get_aggregate_result),
        )
        .route("/v1/files/{id}", get(statistics::get_file_result))
        .route("/v1/objects/{id}", get(statistics::get_object_result))
        .route("/healthcheck/readiness", get(readiness))
        .route("/healthcheck/liveness", get(liveness))
        .route("/metrics", get(metrics_endpoint))
        .layer(middleware::from_fn_with_state(state.clone(), authorize))
        .layer(middleware::from_fn(track_requests))
        .layer(DefaultBodyLimit::max(max_request_size))
        .with_state(state)
}

/// Health and metrics stay reachable without credentials.
fn is_open_path(path: &str) -> bool {
    path.starts_with("/healthcheck/") || path == "/metrics"
}

async fn track_requests(request: Request, next: Next) -> Response {
    if !is_open_path(request.uri().path()) {
        metrics::HTTP_REQUESTS.inc();
        tracing::info!(method = %request.method(), path = request.uri().path(),
            "received webapi request");
    }
    next.run(request).await
}

async fn authorize(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(keys) = &state.auth else {
        return next.run(request).await;
    };

    if is_open_path(request.uri().path()) {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(auth::bearer_token);

    match presented.and_then(|token| keys.validate(token)) {
        Some(alias) => {
            tracing::debug!(user = alias, "authorized request");
            next.run(request).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(types::ObjectScanResponse::error(
                "missing or invalid authorization",
            )),
        )
            .into_response(),
    }
}

/// Readiness probes the cache; a scanner that cannot reach its persistence
/// cannot make progress.
async fn readiness(State(state): State<Arc<AppState>>) -> Response {
    match state.cache.list("readiness-probe-*").await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to the cache");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("cache not connectable: {err}"),
            )
                .into_response()
        }
    }
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn metrics_endpoint() -> String {
    metrics::render()
}
