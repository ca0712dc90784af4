use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use laudaflow_core::DomainError;
use laudaflow_infra::jobs::{JobStoreError, RunnerError};

pub fn runner_error_to_response(err: RunnerError) -> axum::response::Response {
    match err {
        RunnerError::Validation(e) => domain_error_to_response(e),
        RunnerError::Store(e) => store_error_to_response(e),
        RunnerError::QueueFull => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "queue_full",
            "too many jobs in flight, try again later",
        ),
        RunnerError::ShuttingDown => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting_down",
            "service is shutting down",
        ),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        JobStoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        JobStoreError::InvalidState(msg) => json_error(StatusCode::CONFLICT, "invalid_state", msg),
        e @ (JobStoreError::AlreadyExists(_) | JobStoreError::StaleRun { .. }) => {
            json_error(StatusCode::CONFLICT, "conflict", e.to_string())
        }
        JobStoreError::Storage(msg) => {
            tracing::error!(error = %msg, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "storage failure")
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
