//! A pool of workers plus the stale-claim maintenance task.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::config::WorkerConfig;
use super::worker::Worker;
use crate::processor::AttachmentProcessor;
use crate::source::RemoteSource;
use crate::spool::SpoolQueue;

/// Runs `concurrency` workers against one spool.
pub struct WorkerPool<S> {
    queue: Arc<SpoolQueue>,
    processor: Arc<AttachmentProcessor<S>>,
    config: WorkerConfig,
}

impl<S: RemoteSource> WorkerPool<S> {
    pub fn new(
        queue: Arc<SpoolQueue>,
        processor: AttachmentProcessor<S>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            config,
        }
    }

    /// Runs the workers and the maintenance task until `shutdown` fires.
    ///
    /// Returns once every worker has settled its in-flight item.
    pub async fn run(self, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        info!(
            concurrency,
            visibility_timeout = ?self.config.visibility_timeout,
            "Worker pool started"
        );

        let mut tasks = JoinSet::new();
        for index in 0..concurrency {
            let worker = Worker::new(
                index,
                Arc::clone(&self.queue),
                Arc::clone(&self.processor),
                self.config.clone(),
            );
            tasks.spawn(worker.run(shutdown.clone()));
        }
        tasks.spawn(run_maintenance(
            Arc::clone(&self.queue),
            self.config.visibility_timeout,
            self.config.reclaim_interval,
            shutdown,
        ));

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }

        info!("Worker pool stopped");
    }
}

/// Returns abandoned claims to pending every `interval`.
pub async fn run_maintenance(
    queue: Arc<SpoolQueue>,
    visibility_timeout: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match queue.reclaim_stale(visibility_timeout) {
            Ok(0) => {}
            Ok(reclaimed) => info!(reclaimed, "Returned stale claims to pending"),
            Err(e) => error!(error = %e, "Stale-claim sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::NamingStrategy;
    use crate::spool::{QueueItem, SpoolConfig};
    use crate::test_utils::{FakeSource, attachment_ref, ts};
    use chrono::Utc;
    use tempfile::tempdir;

    fn fast_config(concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency,
            idle_backoff_min: Duration::from_millis(5),
            idle_backoff_max: Duration::from_millis(20),
            ..WorkerConfig::new()
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn pool_drains_the_queue_without_duplicates() {
        let dir = tempdir().unwrap();
        let source = FakeSource::new();
        let queue =
            Arc::new(SpoolQueue::open(dir.path().join("spool"), SpoolConfig::DEFAULT).unwrap());
        for i in 0..20 {
            let item = attachment_ref("C1", &format!("A{i}"));
            source.put_file(&item.attachment.url, b"payload");
            queue.enqueue(&QueueItem::new(item, Utc::now())).unwrap();
        }
        let processor =
            AttachmentProcessor::new(source.clone(), dir.path().join("files"), NamingStrategy::IdSuffixed);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            WorkerPool::new(Arc::clone(&queue), processor, fast_config(4)).run(shutdown.clone()),
        );

        wait_until(|| queue.depth().unwrap().live() == 0).await;
        shutdown.cancel();
        handle.await.unwrap();

        let files = std::fs::read_dir(dir.path().join("files/2024-12"))
            .unwrap()
            .count();
        assert_eq!(files, 20);
        assert_eq!(source.fetch_count(), 20);
    }

    #[tokio::test]
    async fn maintenance_returns_stale_claims() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(SpoolQueue::open(dir.path(), SpoolConfig::DEFAULT).unwrap());
        queue
            .enqueue(&QueueItem::new(attachment_ref("C1", "A1"), ts(0)))
            .unwrap();
        // Claimed at the epoch and never settled, as after a crash.
        queue
            .claim_at(Duration::from_secs(60), ts(0))
            .unwrap()
            .unwrap();
        assert_eq!(queue.depth().unwrap().claimed, 1);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_maintenance(
            Arc::clone(&queue),
            Duration::from_secs(60),
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        wait_until(|| queue.depth().unwrap().pending == 1).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(queue.depth().unwrap().claimed, 0);
    }
}
