use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attachment_sync::config::Config;
use attachment_sync::persistence::CheckpointStore;
use attachment_sync::poller::Poller;
use attachment_sync::processor::{AttachmentFilter, AttachmentProcessor};
use attachment_sync::server::{self, AppState};
use attachment_sync::source::MissiveClient;
use attachment_sync::spool::SpoolQueue;
use attachment_sync::worker::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the environment may be set by the supervisor.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "attachment_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded .env");
    }

    let config = Config::from_env()?;
    tracing::info!(?config, "Starting attachment sync");

    std::fs::create_dir_all(&config.storage_path).with_context(|| {
        format!(
            "cannot create storage directory {}",
            config.storage_path.display()
        )
    })?;

    let queue = Arc::new(
        SpoolQueue::open(&config.spool_dir, config.spool)
            .with_context(|| format!("cannot open spool {}", config.spool_dir.display()))?,
    );
    let removed = queue.cleanup_temp_files()?;
    let reclaimed = queue.reclaim_stale(config.worker.visibility_timeout)?;
    let depth = queue.depth()?;
    tracing::info!(
        removed_temp_files = removed,
        reclaimed,
        pending = depth.pending,
        retry = depth.retry,
        dead = depth.dead,
        "Spool recovered"
    );

    let checkpoints = CheckpointStore::new(&config.checkpoint_dir)
        .with_default_lookback(config.default_lookback)
        .with_process_after(config.process_after);
    tracing::info!(
        path = %checkpoints.path().display(),
        cursor = %checkpoints.load().cursor,
        "Resuming from checkpoint"
    );

    let client = MissiveClient::new(
        config.api_token.clone(),
        config.api_base_url.clone(),
        config.request_timeout,
        config.status_policy.clone(),
    )
    .context("cannot build HTTP client")?;

    let poller = Poller::new(
        client.clone(),
        Arc::clone(&queue),
        checkpoints.clone(),
        config.poller.clone(),
    );
    let processor = AttachmentProcessor::new(client, &config.storage_path, config.naming)
        .with_filter(AttachmentFilter::new(config.filter));
    let pool = WorkerPool::new(Arc::clone(&queue), processor, config.worker.clone());

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(poller.run(shutdown.clone()));
    tasks.spawn(pool.run(shutdown.clone()));

    if let Some(addr) = config.status_addr {
        let app_state = AppState::new(Arc::clone(&queue), checkpoints);
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = server::serve(addr, app_state, token).await {
                tracing::error!(error = %e, "Status server failed");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    tracing::info!("Shutdown requested, finishing in-flight items");
    shutdown.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Task failed during shutdown");
        }
    }

    tracing::info!("Stopped");
    Ok(())
}
