//! The incremental poll cycle and loop.
//!
//! # Checkpoint Discipline
//!
//! The checkpoint is written only after the final page of a cycle has been
//! listed and every attachment on every page has been durably enqueued. A
//! cycle that fails part-way leaves the checkpoint untouched, so the next
//! cycle re-observes the whole window; items enqueued before the failure are
//! deduplicated by idempotent enqueue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::config::PollerConfig;
use crate::persistence::{CheckpointError, CheckpointStore};
use crate::source::{RemoteSource, SourceError};
use crate::spool::{EnqueueOutcome, QueueItem, SpoolError, SpoolQueue};

/// Errors that abort a poll cycle.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("listing failed: {0}")]
    Source(#[from] SourceError),

    #[error("enqueue failed: {0}")]
    Spool(#[from] SpoolError),

    #[error("checkpoint save failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// What a successful cycle observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub pages: usize,
    /// Conversations with at least one attachment.
    pub conversations: usize,
    pub attachments: usize,
    pub enqueued: usize,
    pub already_present: usize,
    /// The cursor persisted at the end of the cycle.
    pub cursor: DateTime<Utc>,
}

/// Discovers new attachments and feeds them into the spool.
pub struct Poller<S> {
    source: S,
    queue: Arc<SpoolQueue>,
    checkpoints: CheckpointStore,
    config: PollerConfig,
}

impl<S: RemoteSource> Poller<S> {
    pub fn new(
        source: S,
        queue: Arc<SpoolQueue>,
        checkpoints: CheckpointStore,
        config: PollerConfig,
    ) -> Self {
        Self {
            source,
            queue,
            checkpoints,
            config,
        }
    }

    /// Runs one cycle as of the current time.
    pub async fn poll_once(&self) -> Result<PollSummary, PollError> {
        self.poll_once_at(Utc::now()).await
    }

    /// Runs one cycle with `now` as the cycle start.
    ///
    /// 1. Load the checkpoint cursor `C`
    /// 2. List `[C − overlap, now]` page by page, enqueueing as pages arrive
    /// 3. After the last page, save the checkpoint with cursor `max(C, now)`
    #[instrument(skip(self))]
    pub async fn poll_once_at(&self, now: DateTime<Utc>) -> Result<PollSummary, PollError> {
        let checkpoint = self.checkpoints.load_at(now);
        let since = checkpoint
            .cursor
            .checked_sub_signed(self.config.overlap_delta())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        debug!(cursor = %checkpoint.cursor, %since, "Starting poll cycle");

        let mut summary = PollSummary {
            pages: 0,
            conversations: 0,
            attachments: 0,
            enqueued: 0,
            already_present: 0,
            cursor: checkpoint.cursor,
        };

        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .source
                .list_updated_since(since, now, page_token.as_deref())
                .await?;
            summary.pages += 1;

            for conversation in page.conversations.iter().filter(|c| c.has_attachments()) {
                summary.conversations += 1;
                for attachment in conversation.attachment_refs() {
                    summary.attachments += 1;
                    match self.queue.enqueue(&QueueItem::new(attachment, now))? {
                        EnqueueOutcome::Enqueued => summary.enqueued += 1,
                        EnqueueOutcome::AlreadyPresent(_) => summary.already_present += 1,
                    }
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let next = checkpoint.advanced_to(now, now);
        self.checkpoints.save(&next)?;
        summary.cursor = next.cursor;

        info!(
            pages = summary.pages,
            conversations = summary.conversations,
            attachments = summary.attachments,
            enqueued = summary.enqueued,
            already_present = summary.already_present,
            cursor = %summary.cursor,
            "Poll cycle complete"
        );

        Ok(summary)
    }

    /// Polls until `shutdown` fires.
    ///
    /// Errors are logged and the cycle is retried after the next interval.
    /// Cancellation interrupts both a running cycle and the sleep; an
    /// interrupted cycle has not advanced the checkpoint.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval = ?self.config.poll_interval,
            overlap = ?self.config.overlap,
            "Poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.poll_once() => {
                    if let Err(e) = result {
                        error!(error = %e, "Poll cycle failed, checkpoint not advanced");
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Poller stopped");
    }
}
