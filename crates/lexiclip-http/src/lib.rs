//! The feature-route surface for the clip-search and sentence-analysis
//! service: everything except `/health` and `/openapi.json`, which the
//! binary crate owns directly.

pub mod error;
pub mod openapi;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;

pub use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/search", post(routes::search::search))
        .route("/jobs/{id}", get(routes::search::get_job))
        .route("/analyze", post(routes::analyze::analyze))
        .route("/analyze/stream", post(routes::analyze::analyze_stream))
        .route("/examples/{word}", get(routes::words::examples))
        .route("/word/{word}", get(routes::words::word))
        .route("/words", get(routes::words::words))
        .route("/stats", get(routes::words::stats))
        .with_state(state)
}
