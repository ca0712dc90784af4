use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use laudaflow_core::JobId;

use crate::app::{
    dto::{CreateLaudaRequest, Envelope, JobAccepted, ListQuery},
    errors::{domain_error_to_response, json_error, runner_error_to_response},
    services::AppServices,
};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create).get(list))
        .route("/:id", get(show).delete(destroy))
        .route("/:id/reprocess", post(reprocess))
}

/// Unknown and malformed ids are both "no such job".
fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|_| json_error(StatusCode::NOT_FOUND, "not_found", format!("job {raw} not found")))
}

pub async fn create(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<CreateLaudaRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text()),
    };
    let content = match req.content() {
        Ok(c) => c,
        Err(e) => return domain_error_to_response(e),
    };

    match services.runner.submit(content).await {
        Ok(job) => (
            StatusCode::CREATED,
            Json(Envelope::with_message("processing started", JobAccepted::from(&job))),
        )
            .into_response(),
        Err(e) => runner_error_to_response(e),
    }
}

pub async fn show(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.runner.get(id).await {
        Ok(job) => Json(Envelope::data(job)).into_response(),
        Err(e) => runner_error_to_response(e),
    }
}

pub async fn list(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text()),
    };
    let filter = match query.filter() {
        Ok(f) => f,
        Err(e) => return domain_error_to_response(e),
    };

    match services.runner.list(filter, query.page()).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => runner_error_to_response(e),
    }
}

pub async fn reprocess(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.runner.reprocess(id).await {
        Ok(job) => Json(Envelope::with_message("reprocessing started", JobAccepted::from(&job))).into_response(),
        Err(e) => runner_error_to_response(e),
    }
}

pub async fn destroy(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.runner.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => runner_error_to_response(e),
    }
}
