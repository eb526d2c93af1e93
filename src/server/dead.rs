//! Dead-letter inspection and revival.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use super::AppState;
use crate::spool::{QueueItem, SpoolError};
use crate::types::ItemId;

/// Errors from the dead-letter endpoints.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    /// The ID has no dead-lettered entry.
    #[error("no dead letter for item {0}")]
    NotFound(ItemId),

    /// The ID cannot name a spool entry.
    #[error("invalid item ID: {0}")]
    InvalidId(ItemId),

    #[error("spool error: {0}")]
    Spool(SpoolError),
}

impl From<SpoolError> for DeadLetterError {
    fn from(e: SpoolError) -> Self {
        match e {
            SpoolError::InvalidItemId(id) => DeadLetterError::InvalidId(id),
            other => DeadLetterError::Spool(other),
        }
    }
}

impl IntoResponse for DeadLetterError {
    fn into_response(self) -> Response {
        let status = match &self {
            DeadLetterError::NotFound(_) => StatusCode::NOT_FOUND,
            DeadLetterError::InvalidId(_) => StatusCode::BAD_REQUEST,
            DeadLetterError::Spool(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Body of `GET /dead`.
#[derive(Debug, Serialize)]
pub struct DeadLettersResponse {
    pub count: usize,
    pub items: Vec<QueueItem>,
}

/// Body of a successful `POST /dead/{id}/requeue`.
#[derive(Debug, Serialize)]
pub struct RequeueResponse {
    pub id: ItemId,
    pub requeued: bool,
}

/// Lists dead letters, oldest first, with their last error and attempt count.
pub async fn dead_letters_handler(
    State(app_state): State<AppState>,
) -> Result<Json<DeadLettersResponse>, DeadLetterError> {
    let items = app_state.queue().dead_letters()?;
    Ok(Json(DeadLettersResponse {
        count: items.len(),
        items,
    }))
}

/// Moves a dead letter back to pending with a fresh retry budget.
///
/// # Response
///
/// - 200 OK with `{"id": ..., "requeued": true}`
/// - 404 Not Found if the ID is not dead-lettered
/// - 400 Bad Request if the ID cannot name a spool entry
///
/// ```ignore
/// POST /dead/C1%3AA1/requeue HTTP/1.1
///
/// HTTP/1.1 200 OK
/// {"id": "C1:A1", "requeued": true}
/// ```
pub async fn requeue_handler(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RequeueResponse>, DeadLetterError> {
    let id = ItemId::new(id);
    if !app_state.queue().requeue_dead(&id)? {
        return Err(DeadLetterError::NotFound(id));
    }
    Ok(Json(RequeueResponse { id, requeued: true }))
}
