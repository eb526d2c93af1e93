//! Spool entry records and their on-disk names.
//!
//! The filename of an entry is authoritative for its state; the JSON body
//! carries the payload and bookkeeping (attempts, last error, timestamps).
//! Timestamps that gate a transition (claim time, retry eligibility) are part
//! of the filename so that a single `rename` both changes state and stamps it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AttachmentRef, ItemId};

use super::queue::{Result, SpoolError};

/// Longest escaped key accepted, leaving room for the state suffix within
/// the usual 255-byte filename limit.
const MAX_KEY_LEN: usize = 200;

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Claimed,
    Retry,
    Dead,
}

/// How a failed attempt should be treated by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// May succeed later (network, timeout, local IO). Bounded by the retry ceiling.
    Retryable,

    /// Cannot succeed (missing remote resource, malformed metadata). Dead-lettered at once.
    Permanent,
}

/// A unit of work in the spool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub payload: AttachmentRef,
    pub state: ItemState,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Earliest time a retry entry may be claimed again.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Creates a fresh pending item keyed by the attachment's composite ID.
    pub fn new(payload: AttachmentRef, now: DateTime<Utc>) -> Self {
        QueueItem {
            id: payload.item_id(),
            payload,
            state: ItemState::Pending,
            attempt_count: 0,
            last_error: None,
            enqueued_at: now,
            claimed_at: None,
            not_before: None,
        }
    }
}

/// A successfully claimed item, owned by exactly one worker.
///
/// The path identifies the claim: `complete` and `fail` act on this exact
/// file, so a claim that was reclaimed in the meantime is detected.
#[derive(Debug, Clone)]
pub struct ClaimedItem {
    pub item: QueueItem,
    path: PathBuf,
}

impl ClaimedItem {
    pub(super) fn new(item: QueueItem, path: PathBuf) -> Self {
        ClaimedItem { item, path }
    }

    pub fn id(&self) -> &ItemId {
        &self.item.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// State-specific part of an entry filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Pending,
    Claimed { at_ms: i64 },
    Retry { not_before_ms: i64 },
    Dead,
}

/// A parsed spool filename.
///
/// ```text
/// <key>.pending
/// <key>.<claimed_ms>.claimed
/// <key>.<not_before_ms>.retry
/// <key>.dead
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryName {
    pub key: String,
    pub kind: EntryKind,
}

impl EntryName {
    pub fn new(key: impl Into<String>, kind: EntryKind) -> Self {
        EntryName {
            key: key.into(),
            kind,
        }
    }

    /// Parses a spool filename. Temp files and foreign files yield `None`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (rest, ext) = file_name.rsplit_once('.')?;
        let (key, kind) = match ext {
            "pending" => (rest, EntryKind::Pending),
            "dead" => (rest, EntryKind::Dead),
            "claimed" => {
                let (key, ts) = rest.rsplit_once('.')?;
                (key, EntryKind::Claimed { at_ms: ts.parse().ok()? })
            }
            "retry" => {
                let (key, ts) = rest.rsplit_once('.')?;
                (
                    key,
                    EntryKind::Retry {
                        not_before_ms: ts.parse().ok()?,
                    },
                )
            }
            _ => return None,
        };
        if key.is_empty() {
            return None;
        }
        Some(EntryName::new(key, kind))
    }

    pub fn file_name(&self) -> String {
        match self.kind {
            EntryKind::Pending => format!("{}.pending", self.key),
            EntryKind::Claimed { at_ms } => format!("{}.{}.claimed", self.key, at_ms),
            EntryKind::Retry { not_before_ms } => format!("{}.{}.retry", self.key, not_before_ms),
            EntryKind::Dead => format!("{}.dead", self.key),
        }
    }

    pub fn state(&self) -> ItemState {
        match self.kind {
            EntryKind::Pending => ItemState::Pending,
            EntryKind::Claimed { .. } => ItemState::Claimed,
            EntryKind::Retry { .. } => ItemState::Retry,
            EntryKind::Dead => ItemState::Dead,
        }
    }

    /// Returns the name of the same key in another state.
    pub fn with_kind(&self, kind: EntryKind) -> Self {
        EntryName::new(self.key.clone(), kind)
    }
}

/// An entry found on disk.
#[derive(Debug, Clone)]
pub struct SpoolEntry {
    pub name: EntryName,
    pub path: PathBuf,
}

impl SpoolEntry {
    /// Reads the record, taking the state (and claim time) from the filename.
    pub fn read(&self) -> Result<QueueItem> {
        let bytes = std::fs::read(&self.path)?;
        let mut item: QueueItem = serde_json::from_slice(&bytes)?;
        item.state = self.name.state();
        match self.name.kind {
            EntryKind::Claimed { at_ms } => {
                item.claimed_at = DateTime::from_timestamp_millis(at_ms);
            }
            EntryKind::Retry { not_before_ms } => {
                item.not_before = DateTime::from_timestamp_millis(not_before_ms);
            }
            EntryKind::Pending | EntryKind::Dead => {}
        }
        Ok(item)
    }
}

/// Escapes an item ID into a filename-safe key.
///
/// The escaping is injective, so distinct IDs never share an entry.
pub fn encode_key(id: &ItemId) -> String {
    urlencoding::encode(id.as_str()).into_owned()
}

/// Validates that an item ID can be stored as a spool entry.
///
/// Rejected IDs:
/// - empty
/// - starting with a dot (hidden file, could shadow temp files)
/// - escaping to a key too long for a filename
pub fn validate_item_id(id: &ItemId) -> Result<()> {
    let raw = id.as_str();
    if raw.is_empty() || raw.starts_with('.') || encode_key(id).len() > MAX_KEY_LEN {
        return Err(SpoolError::InvalidItemId(id.clone()));
    }
    Ok(())
}
