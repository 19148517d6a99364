//! Web server module.
//!
//! A thin HTTP front: a health probe and a route that enqueues a test task.

pub mod handlers;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub use handlers::{health, publish_test_message, AppState, EnqueueResponse, HealthResponse};

/// Application routes with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/test/", get(publish_test_message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
