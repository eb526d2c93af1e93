//! Turning a queued attachment into a file on disk.
//!
//! Processing is idempotent: the target path is deterministic, an existing
//! target short-circuits the download, and writes never overwrite.

pub mod download;
pub mod filter;
pub mod naming;

pub use download::{AttachmentProcessor, ProcessError, ProcessOutcome, write_no_clobber};
pub use filter::{AttachmentFilter, FilterConfig, SkipReason};
pub use naming::{DownloadRecord, NamingStrategy};
