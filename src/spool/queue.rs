//! The spool queue: enqueue, claim, complete, fail and recovery.
//!
//! Every state transition is a single `rename` inside the spool directory, so
//! exactly one claimant wins any race on the same entry and a crash at any
//! point leaves each item in exactly one state. Record bodies are staged in
//! temp files private to one call and only ever replace an entry the caller
//! holds as a fresh claim.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::persistence::fsync::fsync_dir;
use crate::types::ItemId;

use super::drain::{
    QueueDepth, cleanup_temp_files, count_by_state, is_expired_claim, list_entries,
    reclaim_stale_claims,
};
use super::entry::{
    ClaimedItem, EntryKind, EntryName, FailureClass, ItemState, QueueItem, SpoolEntry, encode_key,
    validate_item_id,
};

/// Longest diagnostic kept in `last_error`.
const MAX_ERROR_LEN: usize = 500;

/// Errors that can occur during spool operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item ID cannot be stored as a spool entry.
    #[error("invalid item ID: {0}")]
    InvalidItemId(ItemId),

    /// The claim no longer exists (it was reclaimed after timing out).
    #[error("claim lost for item {0}")]
    ClaimLost(ItemId),
}

/// Result type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

/// Retry policy of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpoolConfig {
    /// Failed attempts after which an item is dead-lettered.
    pub max_retries: u32,

    /// Delay before the first retry; doubles on each further attempt.
    pub retry_backoff: Duration,

    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
}

impl SpoolConfig {
    pub const DEFAULT: SpoolConfig = SpoolConfig {
        max_retries: 3,
        retry_backoff: Duration::from_secs(60),
        max_backoff: Duration::from_secs(3600),
    };

    /// Delay before an item that has failed `attempt` times may be claimed again.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.retry_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Result of [`SpoolQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,

    /// The ID already has an entry in the given state; nothing was written.
    AlreadyPresent(ItemState),
}

/// Result of [`SpoolQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retry {
        attempt: u32,
        not_before: DateTime<Utc>,
    },
    Dead {
        attempt: u32,
    },
}

/// A durable file-backed work queue.
///
/// Shared between the poller (enqueue) and workers (claim/complete/fail) by
/// `Arc`. All methods are synchronous filesystem operations.
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    dir: PathBuf,
    config: SpoolConfig,
}

impl SpoolQueue {
    /// Opens (creating if necessary) the spool directory.
    pub fn open(dir: impl Into<PathBuf>, config: SpoolConfig) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(SpoolQueue { dir, config })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Adds an item in the pending state.
    ///
    /// Idempotent: if the ID has any entry (including a dead letter) nothing is
    /// written. The record becomes visible through an exclusive hard link of a
    /// fully synced temp file, so a reader never sees a partial record.
    pub fn enqueue(&self, item: &QueueItem) -> Result<EnqueueOutcome> {
        validate_item_id(&item.id)?;

        if let Some(existing) = self.find_entry(&item.id)? {
            return Ok(EnqueueOutcome::AlreadyPresent(existing.name.state()));
        }

        let name = EntryName::new(encode_key(&item.id), EntryKind::Pending);
        let target = self.dir.join(name.file_name());

        let mut record = item.clone();
        record.state = ItemState::Pending;
        record.claimed_at = None;
        record.not_before = None;

        let staged = self.stage(&name.key, &record)?;
        let linked = std::fs::hard_link(staged.path(), &target);
        if let Err(e) = staged.close() {
            warn!(item_id = %item.id, error = %e, "Failed to remove enqueue temp file");
        }

        match linked {
            Ok(()) => {
                fsync_dir(&self.dir)?;
                debug!(item_id = %item.id, "Enqueued");
                Ok(EnqueueOutcome::Enqueued)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Ok(EnqueueOutcome::AlreadyPresent(ItemState::Pending))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claims the next available item.
    pub fn claim(&self, visibility_timeout: Duration) -> Result<Option<ClaimedItem>> {
        self.claim_at(visibility_timeout, Utc::now())
    }

    /// Claims the next available item as of `now`.
    ///
    /// Candidates, in order: pending entries (oldest first), retry entries whose
    /// `not_before` has passed (earliest first), and claims older than
    /// `visibility_timeout`. Claiming renames the entry to
    /// `<key>.<now_ms>.claimed`; if another claimant renamed it first the
    /// rename fails with `NotFound` and the next candidate is tried.
    pub fn claim_at(
        &self,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedItem>> {
        let now_ms = now.timestamp_millis();
        let timeout_ms = duration_ms(visibility_timeout);

        let mut pending = Vec::new();
        let mut retries = Vec::new();
        let mut expired = Vec::new();

        for entry in list_entries(&self.dir)? {
            let kind = entry.name.kind;
            match kind {
                EntryKind::Pending => {
                    let modified = entry.path.metadata().and_then(|m| m.modified()).ok();
                    pending.push((modified, entry));
                }
                EntryKind::Retry { not_before_ms } if not_before_ms <= now_ms => {
                    retries.push((not_before_ms, entry));
                }
                EntryKind::Claimed { at_ms } if is_expired_claim(kind, now_ms, timeout_ms) => {
                    expired.push((at_ms, entry));
                }
                _ => {}
            }
        }

        pending.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.key.cmp(&b.1.name.key)));
        retries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.key.cmp(&b.1.name.key)));
        expired.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.key.cmp(&b.1.name.key)));

        let candidates = pending
            .into_iter()
            .map(|(_, e)| e)
            .chain(retries.into_iter().map(|(_, e)| e))
            .chain(expired.into_iter().map(|(_, e)| e));

        for candidate in candidates {
            if let Some(claimed) = self.try_claim(candidate, now_ms)? {
                return Ok(Some(claimed));
            }
        }

        Ok(None)
    }

    fn try_claim(&self, candidate: SpoolEntry, now_ms: i64) -> Result<Option<ClaimedItem>> {
        let name = candidate
            .name
            .with_kind(EntryKind::Claimed { at_ms: now_ms });
        let path = self.dir.join(name.file_name());

        match std::fs::rename(&candidate.path, &path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(key = %candidate.name.key, "Lost claim race, trying next entry");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let entry = SpoolEntry { name, path };
        match entry.read() {
            Ok(item) => {
                debug!(item_id = %item.id, attempt = item.attempt_count, "Claimed");
                Ok(Some(ClaimedItem::new(item, entry.path)))
            }
            Err(SpoolError::Json(e)) => {
                warn!(key = %entry.name.key, error = %e, "Unreadable spool record, dead-lettering");
                self.bury(&entry)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Moves an unreadable claimed entry to the dead-letter state as-is.
    fn bury(&self, entry: &SpoolEntry) -> Result<()> {
        let dead = self.dir.join(entry.name.with_kind(EntryKind::Dead).file_name());
        std::fs::rename(&entry.path, &dead)?;
        fsync_dir(&self.dir)?;
        Ok(())
    }

    /// Removes a successfully processed item.
    ///
    /// Returns [`SpoolError::ClaimLost`] if the claim was reclaimed in the
    /// meantime; the item is then owned by someone else.
    pub fn complete(&self, claimed: &ClaimedItem) -> Result<()> {
        match std::fs::remove_file(claimed.path()) {
            Ok(()) => {
                fsync_dir(&self.dir)?;
                debug!(item_id = %claimed.id(), "Completed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SpoolError::ClaimLost(claimed.id().clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Records a failed attempt.
    pub fn fail(
        &self,
        claimed: &ClaimedItem,
        error: &str,
        class: FailureClass,
    ) -> Result<FailOutcome> {
        self.fail_at(claimed, error, class, Utc::now())
    }

    /// Records a failed attempt as of `now`.
    ///
    /// A retryable failure below the retry ceiling becomes a retry entry
    /// eligible after the backoff for this attempt. A permanent failure, or a
    /// retryable one that reaches the ceiling, becomes a dead letter.
    pub fn fail_at(
        &self,
        claimed: &ClaimedItem,
        error: &str,
        class: FailureClass,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let attempt = claimed.item.attempt_count.saturating_add(1);
        let key = encode_key(claimed.id());

        let mut record = claimed.item.clone();
        record.attempt_count = attempt;
        record.last_error = Some(error.chars().take(MAX_ERROR_LEN).collect());
        record.claimed_at = None;

        let (kind, outcome) =
            if class == FailureClass::Retryable && attempt < self.config.max_retries {
                let not_before_ms = now
                    .timestamp_millis()
                    .saturating_add(duration_ms(self.config.backoff_for_attempt(attempt)));
                let not_before =
                    DateTime::from_timestamp_millis(not_before_ms).unwrap_or(DateTime::<Utc>::MAX_UTC);
                record.state = ItemState::Retry;
                record.not_before = Some(not_before);
                (
                    EntryKind::Retry { not_before_ms },
                    FailOutcome::Retry {
                        attempt,
                        not_before,
                    },
                )
            } else {
                record.state = ItemState::Dead;
                record.not_before = None;
                (EntryKind::Dead, FailOutcome::Dead { attempt })
            };

        if !self.transition(claimed.path(), &key, &record, kind, now.timestamp_millis())? {
            return Err(SpoolError::ClaimLost(claimed.id().clone()));
        }

        match outcome {
            FailOutcome::Retry { not_before, .. } => {
                info!(item_id = %record.id, attempt, %not_before, error, "Scheduled retry");
            }
            FailOutcome::Dead { .. } => {
                warn!(item_id = %record.id, attempt, ?class, error, "Dead-lettered");
            }
        }

        Ok(outcome)
    }

    /// Returns claims older than `visibility_timeout` to pending.
    pub fn reclaim_stale(&self, visibility_timeout: Duration) -> Result<usize> {
        self.reclaim_stale_at(visibility_timeout, Utc::now())
    }

    pub fn reclaim_stale_at(&self, visibility_timeout: Duration, now: DateTime<Utc>) -> Result<usize> {
        reclaim_stale_claims(&self.dir, duration_ms(visibility_timeout), now)
    }

    /// Removes orphaned temp files. Startup only.
    pub fn cleanup_temp_files(&self) -> Result<usize> {
        cleanup_temp_files(&self.dir)
    }

    /// Counts entries per state.
    pub fn depth(&self) -> Result<QueueDepth> {
        count_by_state(&self.dir)
    }

    /// Reads every dead letter, oldest first. Unreadable records are skipped.
    pub fn dead_letters(&self) -> Result<Vec<QueueItem>> {
        let mut items = Vec::new();
        for entry in list_entries(&self.dir)? {
            if entry.name.kind != EntryKind::Dead {
                continue;
            }
            match entry.read() {
                Ok(item) => items.push(item),
                Err(e) => warn!(path = %entry.path.display(), error = %e, "Skipping unreadable dead letter"),
            }
        }
        items.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    /// Moves a dead letter back to pending with its attempt count reset.
    ///
    /// Returns false if the ID has no dead entry.
    pub fn requeue_dead(&self, id: &ItemId) -> Result<bool> {
        validate_item_id(id)?;
        let Some(entry) = self.find_entry(id)? else {
            return Ok(false);
        };
        if entry.name.kind != EntryKind::Dead {
            return Ok(false);
        }

        let mut record = entry.read()?;
        record.state = ItemState::Pending;
        record.attempt_count = 0;
        record.last_error = None;
        record.claimed_at = None;
        record.not_before = None;

        let now_ms = Utc::now().timestamp_millis();
        if !self.transition(&entry.path, &entry.name.key, &record, EntryKind::Pending, now_ms)? {
            return Ok(false);
        }
        info!(item_id = %id, "Requeued dead letter");
        Ok(true)
    }

    /// Reads the current record for an ID, in whatever state it is.
    pub fn find(&self, id: &ItemId) -> Result<Option<QueueItem>> {
        validate_item_id(id)?;
        match self.find_entry(id)? {
            Some(entry) => Ok(Some(entry.read()?)),
            None => Ok(None),
        }
    }

    /// Writes `record` to a synced temp file that no other call can see.
    fn stage(&self, key: &str, record: &QueueItem) -> Result<NamedTempFile> {
        let mut staged = tempfile::Builder::new()
            .prefix(&format!("{key}."))
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        staged.write_all(&serde_json::to_vec_pretty(record)?)?;
        staged.as_file().sync_all()?;
        Ok(staged)
    }

    /// Moves the entry at `from` to state `to` with `record` as its body.
    ///
    /// The entry is first renamed to a claim stamped `now_ms`. That rename is
    /// the ownership check, and no claimant or reclaim touches a claim before
    /// the visibility timeout. The staged body then replaces the claim and a
    /// last rename publishes it, so the new state is never visible with the
    /// old body. A crash at any step leaves exactly one entry.
    ///
    /// Returns false if `from` no longer exists.
    fn transition(
        &self,
        from: &Path,
        key: &str,
        record: &QueueItem,
        to: EntryKind,
        now_ms: i64,
    ) -> Result<bool> {
        let staged = self.stage(key, record)?;
        let holding = self
            .dir
            .join(EntryName::new(key, EntryKind::Claimed { at_ms: now_ms }).file_name());

        match std::fs::rename(from, &holding) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        staged.persist(&holding).map_err(|e| e.error)?;

        let target = self.dir.join(EntryName::new(key, to).file_name());
        std::fs::rename(&holding, &target)?;
        fsync_dir(&self.dir)?;
        Ok(true)
    }

    fn find_entry(&self, id: &ItemId) -> Result<Option<SpoolEntry>> {
        let key = encode_key(id);
        Ok(list_entries(&self.dir)?
            .into_iter()
            .find(|entry| entry.name.key == key))
    }
}

/// Converts a duration to whole milliseconds, saturating.
fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
