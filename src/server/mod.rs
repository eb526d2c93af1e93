//! HTTP status server.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns 200 if the server is running
//! - `GET /status` - Returns queue depth per state and the last checkpoint as JSON
//! - `GET /dead` - Lists dead-lettered items with their last error
//! - `POST /dead/{id}/requeue` - Returns a dead letter to pending with its attempts reset

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::persistence::CheckpointStore;
use crate::spool::SpoolQueue;

pub mod dead;
pub mod health;
pub mod status;

pub use dead::{DeadLetterError, dead_letters_handler, requeue_handler};
pub use health::health_handler;
pub use status::{StatusError, StatusResponse, status_handler};

/// Shared application state, passed to handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    queue: Arc<SpoolQueue>,
    checkpoints: CheckpointStore,
}

impl AppState {
    pub fn new(queue: Arc<SpoolQueue>, checkpoints: CheckpointStore) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { queue, checkpoints }),
        }
    }

    pub fn queue(&self) -> &SpoolQueue {
        &self.inner.queue
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.inner.checkpoints
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/dead", get(dead_letters_handler))
        .route("/dead/{id}/requeue", post(requeue_handler))
        .with_state(app_state)
}

/// Serves the router on `addr` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    app_state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Status server listening");
    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
