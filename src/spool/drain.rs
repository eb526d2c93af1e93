//! Scanning the spool directory.
//!
//! Every query about queue contents is answered from a directory listing:
//! the state of each entry is encoded in its filename, so depth and stale
//! claims can be found without reading payloads.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::persistence::fsync::fsync_dir;

use super::entry::{EntryKind, EntryName, SpoolEntry};
use super::queue::Result;

/// Number of entries in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: usize,
    pub claimed: usize,
    pub retry: usize,
    pub dead: usize,
}

impl QueueDepth {
    /// Entries still in active rotation.
    pub fn live(&self) -> usize {
        self.pending + self.claimed + self.retry
    }
}

/// Lists all live and dead entries in the spool directory.
///
/// Temp files and unrelated files are skipped. The order is unspecified.
pub fn list_entries(spool_dir: &Path) -> Result<Vec<SpoolEntry>> {
    if !spool_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(spool_dir)? {
        let entry = entry?;
        let path = entry.path();
        if let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(EntryName::parse)
        {
            entries.push(SpoolEntry { name, path });
        }
    }
    Ok(entries)
}

/// Counts entries per state without reading any payload.
pub fn count_by_state(spool_dir: &Path) -> Result<QueueDepth> {
    let mut depth = QueueDepth::default();
    for entry in list_entries(spool_dir)? {
        match entry.name.kind {
            EntryKind::Pending => depth.pending += 1,
            EntryKind::Claimed { .. } => depth.claimed += 1,
            EntryKind::Retry { .. } => depth.retry += 1,
            EntryKind::Dead => depth.dead += 1,
        }
    }
    Ok(depth)
}

/// Returns claimed entries whose claim is older than `visibility_timeout_ms`.
pub(super) fn is_expired_claim(kind: EntryKind, now_ms: i64, visibility_timeout_ms: i64) -> bool {
    matches!(kind, EntryKind::Claimed { at_ms } if now_ms.saturating_sub(at_ms) > visibility_timeout_ms)
}

/// Returns orphaned claims to the pending state.
///
/// A worker that crashes mid-processing leaves its `.claimed` entry behind.
/// Once the claim is older than the visibility timeout it is renamed back to
/// `.pending` so another worker can pick it up. Losing a rename race to a
/// claimant (the entry vanished) is not an error.
///
/// # Durability
///
/// The directory is fsynced after any rename so a power loss cannot
/// resurrect the stale claims.
pub fn reclaim_stale_claims(
    spool_dir: &Path,
    visibility_timeout_ms: i64,
    now: DateTime<Utc>,
) -> Result<usize> {
    let now_ms = now.timestamp_millis();
    let mut reclaimed = 0;

    for entry in list_entries(spool_dir)? {
        if !is_expired_claim(entry.name.kind, now_ms, visibility_timeout_ms) {
            continue;
        }

        let target = spool_dir.join(entry.name.with_kind(EntryKind::Pending).file_name());
        match std::fs::rename(&entry.path, &target) {
            Ok(()) => {
                debug!(key = %entry.name.key, "Reclaimed stale claim");
                reclaimed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key = %entry.name.key, "Stale claim already moved");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if reclaimed > 0 {
        fsync_dir(spool_dir)?;
        info!(count = reclaimed, "Returned stale claims to pending");
    }

    Ok(reclaimed)
}

/// Removes orphaned `*.tmp` files left by a crash mid-write.
///
/// **Critical**: call this only at startup, before the poller and workers
/// start. A concurrent enqueue or record rewrite owns its temp file until the
/// final rename.
pub fn cleanup_temp_files(spool_dir: &Path) -> Result<usize> {
    if !spool_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in std::fs::read_dir(spool_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "tmp") {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
            }
        }
    }

    if removed > 0 {
        fsync_dir(spool_dir)?;
        info!(count = removed, "Removed orphaned spool temp files");
    }
    Ok(removed)
}
