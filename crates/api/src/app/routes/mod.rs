use axum::Router;

pub mod lauda_processing;
pub mod system;

/// Router for all job endpoints.
pub fn router() -> Router {
    Router::new().nest("/lauda-processing", lauda_processing::router())
}
