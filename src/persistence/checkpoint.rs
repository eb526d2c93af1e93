//! Checkpoint persistence for incremental polling.
//!
//! The checkpoint records the cursor (last synchronized update time) of the
//! remote source. It is a single small JSON file written by the poller only.
//!
//! # File Format
//!
//! ```json
//! { "schema_version": 1, "cursor": "2024-12-01T00:00:00Z", "updated_at": "..." }
//! ```
//!
//! # Failure Semantics
//!
//! - Writes use write-to-temp-then-rename, so the file is always either the
//!   old or the new complete value.
//! - A missing, corrupt or incompatible file loads as the default cursor
//!   (fail open to the lookback window) instead of failing startup.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::fsync::write_atomic;

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Default lookback on first run (30 days).
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// Checkpoint filename inside the checkpoint directory.
pub const CHECKPOINT_FILE: &str = "missive.json";

/// Errors that can occur while saving a checkpoint.
///
/// Loading never fails; see [`CheckpointStore::load`].
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// The persisted sync position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version for forward-compatible migrations.
    pub schema_version: u32,

    /// Last observed update time of the remote source.
    pub cursor: DateTime<Utc>,

    /// When this checkpoint was written.
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(cursor: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        Checkpoint {
            schema_version: SCHEMA_VERSION,
            cursor,
            updated_at,
        }
    }

    /// Returns the checkpoint that follows a successful cycle.
    ///
    /// The cursor never moves backwards, even if the local clock did.
    pub fn advanced_to(&self, cursor: DateTime<Utc>, now: DateTime<Utc>) -> Checkpoint {
        Checkpoint::new(self.cursor.max(cursor), now)
    }
}

/// Loads and saves the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    default_lookback: Duration,
    process_after: Option<NaiveDate>,
}

impl CheckpointStore {
    /// Creates a store for `<dir>/missive.json` with the default 30-day lookback.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        CheckpointStore {
            path: dir.as_ref().join(CHECKPOINT_FILE),
            default_lookback: Duration::days(DEFAULT_LOOKBACK_DAYS),
            process_after: None,
        }
    }

    /// Sets the lookback used when no checkpoint exists.
    pub fn with_default_lookback(mut self, lookback: Duration) -> Self {
        self.default_lookback = lookback;
        self
    }

    /// Sets a fixed start date used (instead of the lookback) when no checkpoint exists.
    pub fn with_process_after(mut self, date: Option<NaiveDate>) -> Self {
        self.process_after = date;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the checkpoint, falling back to the default cursor.
    pub fn load(&self) -> Checkpoint {
        self.load_at(Utc::now())
    }

    /// Loads the checkpoint as of `now`, falling back to the default cursor.
    pub fn load_at(&self, now: DateTime<Utc>) -> Checkpoint {
        match self.try_load() {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                debug!(path = %self.path.display(), "No checkpoint found, using default cursor");
                self.default_checkpoint(now)
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Checkpoint unreadable, using default cursor"
                );
                self.default_checkpoint(now)
            }
        }
    }

    /// Attempts to load the checkpoint, returning None if the file doesn't exist.
    ///
    /// Malformed JSON and schema mismatches are returned as errors so the
    /// caller can log them.
    pub fn try_load(&self) -> std::result::Result<Option<Checkpoint>, LoadError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LoadError::Io(e)),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;

        if checkpoint.schema_version != SCHEMA_VERSION {
            return Err(LoadError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                got: checkpoint.schema_version,
            });
        }

        Ok(Some(checkpoint))
    }

    /// Saves the checkpoint atomically.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&self.path, &bytes)?;
        debug!(cursor = %checkpoint.cursor, "Saved checkpoint");
        Ok(())
    }

    fn default_checkpoint(&self, now: DateTime<Utc>) -> Checkpoint {
        let cursor = self
            .process_after
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or_else(|| {
                now.checked_sub_signed(self.default_lookback)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            });
        Checkpoint::new(cursor, now)
    }
}

/// Why a checkpoint file could not be used.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

/// Parses the `DD.MM.YYYY` start date format.
pub fn parse_process_after(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%d.%m.%Y").ok()
}
