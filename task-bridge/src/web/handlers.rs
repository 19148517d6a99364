//! HTTP endpoint handlers.
//!
//! The handlers only enqueue; all processing happens in the consumer.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::connection::ConnectionManager;
use crate::queue::{PublishError, Publisher};
use crate::tasks::{test_message, TEST_MESSAGE_TEXT};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub publisher: Publisher,
    pub manager: ConnectionManager,
}

impl AppState {
    pub fn new(config: Config, manager: ConnectionManager) -> Self {
        let publisher = Publisher::new(manager.clone(), config.rmq_queue.clone());
        Self {
            config: Arc::new(config),
            publisher,
            manager,
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker_connected: bool,
}

/// Health check endpoint. Always 200; the broker state is informational.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        broker_connected: state.manager.status().await,
    })
}

// =============================================================================
// Test Message
// =============================================================================

/// Enqueue response.
#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub status: &'static str,
    pub queue: String,
}

/// Publish a `test_message` to the configured queue.
///
/// 503 when the broker connection is down, 500 for any other publish failure.
pub async fn publish_test_message(State(state): State<AppState>) -> impl IntoResponse {
    let queue = state.publisher.default_destination().to_string();

    match state
        .publisher
        .publish_one(&test_message(TEST_MESSAGE_TEXT))
        .await
    {
        Ok(()) => {
            info!(queue = %queue, "test_message_enqueued");
            (
                StatusCode::OK,
                Json(EnqueueResponse {
                    status: "enqueued",
                    queue,
                }),
            )
        }
        Err(PublishError::NotConnected) => {
            warn!(queue = %queue, "test_message_broker_unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(EnqueueResponse {
                    status: "unavailable",
                    queue,
                }),
            )
        }
        Err(e) => {
            error!(queue = %queue, error = %e, "test_message_publish_failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(EnqueueResponse {
                    status: "error",
                    queue,
                }),
            )
        }
    }
}
