//! A single worker loop: claim, process, settle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::config::WorkerConfig;
use crate::processor::{AttachmentProcessor, ProcessOutcome};
use crate::source::RemoteSource;
use crate::spool::{ClaimedItem, FailOutcome, SpoolError, SpoolQueue};

/// How one claimed item was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Processing succeeded (including skips and already-present targets)
    /// and the entry was removed.
    Completed(ProcessOutcome),

    Retrying {
        attempt: u32,
        not_before: DateTime<Utc>,
    },

    DeadLettered {
        attempt: u32,
    },

    /// The claim was reclaimed while we were processing; another worker owns it now.
    ClaimLost,
}

/// Pulls items from the spool and runs them through the processor.
pub struct Worker<S> {
    index: usize,
    queue: Arc<SpoolQueue>,
    processor: Arc<AttachmentProcessor<S>>,
    config: WorkerConfig,
}

impl<S: RemoteSource> Worker<S> {
    pub fn new(
        index: usize,
        queue: Arc<SpoolQueue>,
        processor: Arc<AttachmentProcessor<S>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            index,
            queue,
            processor,
            config,
        }
    }

    /// Claims and processes at most one item.
    ///
    /// Returns `Ok(None)` when nothing is claimable. Only queue failures are
    /// returned as errors; processing failures are recorded on the item.
    pub async fn process_one(&self) -> Result<Option<WorkOutcome>, SpoolError> {
        let Some(claimed) = self.queue.claim(self.config.visibility_timeout)? else {
            return Ok(None);
        };
        self.settle(claimed).await.map(Some)
    }

    #[instrument(
        skip_all,
        fields(worker = self.index, item_id = %claimed.id(), attempt = claimed.item.attempt_count + 1)
    )]
    async fn settle(&self, claimed: ClaimedItem) -> Result<WorkOutcome, SpoolError> {
        let settled = match self.processor.process(&claimed.item.payload).await {
            Ok(outcome) => {
                debug!(?outcome, "Processed");
                self.queue
                    .complete(&claimed)
                    .map(|()| WorkOutcome::Completed(outcome))
            }
            Err(e) => {
                let class = e.class();
                self.queue
                    .fail(&claimed, &e.to_string(), class)
                    .map(|outcome| match outcome {
                        FailOutcome::Retry {
                            attempt,
                            not_before,
                        } => WorkOutcome::Retrying {
                            attempt,
                            not_before,
                        },
                        FailOutcome::Dead { attempt } => WorkOutcome::DeadLettered { attempt },
                    })
            }
        };

        match settled {
            Err(SpoolError::ClaimLost(id)) => {
                warn!(item_id = %id, "Claim was reclaimed during processing, result discarded");
                Ok(WorkOutcome::ClaimLost)
            }
            other => other,
        }
    }

    /// Processes items until `shutdown` fires.
    ///
    /// Cancellation is checked between items only, so an item being processed
    /// is always settled. Queue errors are logged and backed off.
    pub async fn run(self, shutdown: CancellationToken) {
        debug!(worker = self.index, "Worker started");
        let mut idle: u32 = 0;

        while !shutdown.is_cancelled() {
            match self.process_one().await {
                Ok(Some(_)) => {
                    idle = 0;
                    continue;
                }
                Ok(None) => idle = idle.saturating_add(1),
                Err(e) => {
                    error!(worker = self.index, error = %e, "Queue error");
                    idle = idle.saturating_add(1);
                }
            }

            let delay = self.config.idle_backoff(self.index, idle);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(worker = self.index, "Worker stopped");
    }
}
