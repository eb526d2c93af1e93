//! Durable file-backed work queue for attachment downloads.
//!
//! Each item is one file in the spool directory. Its state is encoded in the
//! filename and every transition is a `rename`:
//!
//! ```text
//! <key>.pending                 enqueued, waiting for a worker
//! <key>.<claimed_ms>.claimed    owned by a worker since <claimed_ms>
//! <key>.<not_before_ms>.retry   failed, claimable again after <not_before_ms>
//! <key>.dead                    dead-lettered, kept for inspection
//! *.tmp                         atomic write in progress, never a live entry
//! ```
//!
//! `<key>` is the URL-escaped item ID, so an ID maps to exactly one key.
//!
//! # Crash Safety
//!
//! - Records are written to a temp file and fsynced before becoming visible
//! - Enqueue links the temp file into place exclusively, so it never clobbers
//! - Claims left behind by a crashed worker are returned to pending by
//!   [`SpoolQueue::reclaim_stale`] once older than the visibility timeout
//!
//! Delivery is at-least-once: a reclaimed item may be processed twice, which
//! the attachment processor tolerates by never overwriting an existing file.

pub mod drain;
pub mod entry;
pub mod queue;

pub use drain::{QueueDepth, cleanup_temp_files, count_by_state, reclaim_stale_claims};
pub use entry::{ClaimedItem, FailureClass, ItemState, QueueItem};
pub use queue::{EnqueueOutcome, FailOutcome, Result, SpoolConfig, SpoolError, SpoolQueue};
