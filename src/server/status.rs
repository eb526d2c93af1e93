//! Queue depth and sync position for monitoring.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use super::AppState;
use crate::persistence::Checkpoint;
use crate::spool::{QueueDepth, SpoolError};

/// Body of `GET /status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub queue: QueueDepth,

    /// The persisted checkpoint, or `null` before the first completed cycle
    /// (or if the file is unreadable).
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("spool unreadable: {0}")]
    Spool(#[from] SpoolError),
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// Status handler.
///
/// # Example
///
/// ```ignore
/// GET /status HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: application/json
///
/// {
///   "queue": { "pending": 3, "claimed": 1, "retry": 0, "dead": 2 },
///   "checkpoint": { "schema_version": 1, "cursor": "2024-12-01T00:00:00Z", ... }
/// }
/// ```
pub async fn status_handler(
    State(app_state): State<AppState>,
) -> Result<Json<StatusResponse>, StatusError> {
    let queue = app_state.queue().depth()?;
    let checkpoint = match app_state.checkpoints().try_load() {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            warn!(error = %e, "Checkpoint unreadable");
            None
        }
    };

    Ok(Json(StatusResponse { queue, checkpoint }))
}
