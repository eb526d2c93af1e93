//! The remote conversation API the attachments are mirrored from.
//!
//! Key features:
//! - `RemoteSource` trait so the poller and processor can run against fakes
//! - Exponential backoff retry for transient failures, honoring `Retry-After`
//! - Configurable set of HTTP statuses treated as permanently gone

mod client;
mod error;
mod missive;
mod retry;

pub use client::{Page, RemoteSource};
pub use error::{SourceError, SourceErrorKind, StatusPolicy};
pub use missive::{DEFAULT_BASE_URL, MissiveClient};
pub use retry::{RetryConfig, RetryResult, retry_with_backoff};
