//! Scheduling endpoints: accept a file or an object reference for scanning.

use super::types::{RequestObjectScan, ScheduleResponse};
use super::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

/// `POST /v1/files` - multipart upload, field `file`.
pub async fn scan_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<ScheduleResponse>) {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("upload").to_string();
        match field.bytes().await {
            Ok(bytes) => {
                upload = Some((filename, bytes.to_vec()));
                break;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to read uploaded file");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ScheduleResponse::error("failed to open file")),
                );
            }
        }
    }

    let Some((filename, data)) = upload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ScheduleResponse::error("no file found")),
        );
    };

    match state.schedule.schedule(&filename, data).await {
        Ok(scan_id) => (StatusCode::OK, Json(ScheduleResponse::ok(scan_id))),
        Err(err) => {
            tracing::error!(filename, error = %err, "failed to schedule file for scanning");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ScheduleResponse::error("could not schedule file for scan")),
            )
        }
    }
}

/// `POST /v1/objects` - JSON body naming a bucket and key.
pub async fn scan_object(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RequestObjectScan>, JsonRejection>,
) -> (StatusCode, Json<ScheduleResponse>) {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ScheduleResponse::error(rejection.to_string())),
            )
        }
    };

    if request.bucket.is_empty() || request.key.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ScheduleResponse::error("bucket and key are required")),
        );
    }

    match state
        .schedule
        .schedule_object(&request.bucket, &request.key)
        .await
    {
        Ok(scan_id) => (StatusCode::OK, Json(ScheduleResponse::ok(scan_id))),
        Err(err) => {
            tracing::error!(bucket = %request.bucket, key = %request.key, error = %err,
                "failed to schedule object for scanning");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ScheduleResponse::error("could not schedule object for scan")),
            )
        }
    }
}
