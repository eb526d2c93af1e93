//! Incremental discovery of new attachments.
//!
//! The poller lists conversations updated since the checkpoint (minus an
//! overlap window), enqueues every attachment it finds, and advances the
//! checkpoint only after the whole cycle succeeded.

pub mod config;
pub mod cycle;

pub use config::{DEFAULT_OVERLAP_SECS, DEFAULT_POLL_INTERVAL_SECS, PollerConfig};
pub use cycle::{PollError, PollSummary, Poller};
