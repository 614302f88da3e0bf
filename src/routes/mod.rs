pub mod generate;
pub mod health;
pub mod metrics;

use axum::{routing::get, routing::post, Router};

use crate::app_state::AppState;

/// API routes without the metrics endpoint or middleware layers.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/generate", post(generate::submit_generation))
        .route("/api/v1/jobs/{job_id}", get(generate::get_job_status))
        .with_state(state)
}
