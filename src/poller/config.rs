//! Poll loop timing.
//!
//! # Overlap Window
//!
//! Each cycle queries from `checkpoint − overlap` rather than from the
//! checkpoint itself. Conversations whose update becomes visible in the API
//! slightly after their timestamp (indexing lag, clock skew between us and the
//! server) are re-observed by the next cycle instead of being missed.
//! Re-observed attachments are deduplicated by idempotent enqueue.

use std::time::Duration;

/// Default interval between poll cycles (60 seconds).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default overlap subtracted from the checkpoint (120 seconds).
pub const DEFAULT_OVERLAP_SECS: u64 = 120;

/// Configuration for the poll loop.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Sleep between the end of one cycle and the start of the next.
    pub poll_interval: Duration,

    /// How far before the checkpoint each query starts.
    pub overlap: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        PollerConfig {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            overlap: Duration::from_secs(DEFAULT_OVERLAP_SECS),
        }
    }

    /// The overlap as a chrono duration, saturating on overflow.
    pub fn overlap_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.overlap).unwrap_or(chrono::Duration::MAX)
    }
}
