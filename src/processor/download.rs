//! Downloading one attachment to its deterministic target path.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::filter::{AttachmentFilter, SkipReason};
use super::naming::{DownloadRecord, NamingStrategy};
use crate::persistence::fsync::fsync_dir;
use crate::source::{RemoteSource, SourceError, SourceErrorKind};
use crate::spool::FailureClass;
use crate::types::AttachmentRef;

/// What processing an attachment did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Downloaded { path: PathBuf, bytes: usize },

    /// The target already existed; nothing was fetched or written.
    AlreadyPresent { path: PathBuf },

    Skipped(SkipReason),
}

/// Errors that can occur while processing an attachment.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Required metadata is missing; retrying cannot help.
    #[error("invalid attachment metadata: {0}")]
    InvalidMetadata(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    /// Local filesystem failure (disk full, permission denied, ...).
    #[error("IO error writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ProcessError {
    /// How the queue should treat this failure.
    ///
    /// Only errors that cannot succeed on a later attempt are permanent;
    /// anything ambiguous is retried up to the retry ceiling.
    pub fn class(&self) -> FailureClass {
        match self {
            ProcessError::InvalidMetadata(_) => FailureClass::Permanent,
            ProcessError::Source(e) if e.kind.is_permanent() => FailureClass::Permanent,
            ProcessError::Source(_) | ProcessError::Io { .. } => FailureClass::Retryable,
        }
    }
}

/// Downloads attachments into `{root}/{YYYY-MM}/`.
#[derive(Debug, Clone)]
pub struct AttachmentProcessor<S> {
    source: S,
    root: PathBuf,
    naming: NamingStrategy,
    filter: AttachmentFilter,
}

impl<S: RemoteSource> AttachmentProcessor<S> {
    pub fn new(source: S, root: impl Into<PathBuf>, naming: NamingStrategy) -> Self {
        Self {
            source,
            root: root.into(),
            naming,
            filter: AttachmentFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: AttachmentFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Computes where an attachment would be stored.
    pub fn plan(&self, item: &AttachmentRef) -> DownloadRecord {
        DownloadRecord::plan(&self.root, &item.attachment, self.naming)
    }

    /// Downloads one attachment. Idempotent: an existing target is never
    /// fetched again or overwritten.
    #[instrument(skip_all, fields(item_id = %item.item_id()))]
    pub async fn process(&self, item: &AttachmentRef) -> Result<ProcessOutcome, ProcessError> {
        let attachment = &item.attachment;

        if let Some(reason) = self.filter.should_skip(attachment) {
            info!(filename = %attachment.filename, %reason, "Skipping attachment");
            return Ok(ProcessOutcome::Skipped(reason));
        }

        validate(item)?;

        let record = self.plan(item);
        let path = record.target_path;

        if path.exists() {
            debug!(path = %path.display(), "Already downloaded");
            return Ok(ProcessOutcome::AlreadyPresent { path });
        }

        let bytes = self.fetch(item).await?;
        let len = bytes.len();

        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || write_no_clobber(&target, &bytes))
            .await
            .map_err(io::Error::other)
            .and_then(|r| r)
            .map_err(|source| ProcessError::Io {
                path: path.clone(),
                source,
            })?;

        if written {
            info!(path = %path.display(), bytes = len, "Saved attachment");
            Ok(ProcessOutcome::Downloaded { path, bytes: len })
        } else {
            debug!(path = %path.display(), "Lost write race, target already present");
            Ok(ProcessOutcome::AlreadyPresent { path })
        }
    }

    /// Fetches the bytes, refreshing an expired signed URL once.
    async fn fetch(&self, item: &AttachmentRef) -> Result<Vec<u8>, ProcessError> {
        let attachment = &item.attachment;

        let err = match self.source.fetch_attachment_bytes(&attachment.url).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => e,
        };

        if err.kind != SourceErrorKind::Expired {
            return Err(err.into());
        }
        let Some(message_id) = &item.message_id else {
            return Err(err.into());
        };

        warn!(attachment_id = %attachment.id, "Download URL expired, requesting a fresh one");
        match self
            .source
            .refresh_attachment_url(message_id, &attachment.id)
            .await?
        {
            Some(url) => Ok(self.source.fetch_attachment_bytes(&url).await?),
            None => Err(SourceError::not_found(format!(
                "attachment {} no longer on message {}",
                attachment.id, message_id
            ))
            .into()),
        }
    }
}

fn validate(item: &AttachmentRef) -> Result<(), ProcessError> {
    let attachment = &item.attachment;
    if attachment.id.as_str().trim().is_empty() {
        return Err(ProcessError::InvalidMetadata("empty attachment id".into()));
    }
    if attachment.filename.trim().is_empty() {
        return Err(ProcessError::InvalidMetadata(format!(
            "attachment {} has no filename",
            attachment.id
        )));
    }
    if attachment.url.trim().is_empty() {
        return Err(ProcessError::InvalidMetadata(format!(
            "attachment {} has no download URL",
            attachment.id
        )));
    }
    Ok(())
}

/// Writes `bytes` to `path` unless it already exists.
///
/// The bytes go to a synced temp file in the target directory which is then
/// linked into place without clobbering, so the target is either absent or
/// complete. Returns false if another writer created the target first.
pub fn write_no_clobber(path: &Path, bytes: &[u8]) -> io::Result<bool> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    match tmp.persist_noclobber(path) {
        Ok(_) => {
            fsync_dir(dir)?;
            Ok(true)
        }
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::filter::FilterConfig;
    use crate::test_utils::{FakeSource, attachment_ref};
    use crate::types::MessageId;
    use tempfile::tempdir;

    fn processor(source: FakeSource, root: &Path) -> AttachmentProcessor<FakeSource> {
        AttachmentProcessor::new(source, root, NamingStrategy::IdSuffixed)
    }

    #[tokio::test]
    async fn downloads_to_month_folder() {
        let dir = tempdir().unwrap();
        let item = attachment_ref("C1", "A1");
        let source = FakeSource::new();
        source.put_file(&item.attachment.url, b"%PDF-1.7");

        let outcome = processor(source.clone(), dir.path()).process(&item).await.unwrap();

        let expected = dir.path().join("2024-12").join("invoice_A1.pdf");
        assert_eq!(
            outcome,
            ProcessOutcome::Downloaded {
                path: expected.clone(),
                bytes: 8
            }
        );
        assert_eq!(std::fs::read(&expected).unwrap(), b"%PDF-1.7");
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn second_run_is_already_present_without_fetching() {
        let dir = tempdir().unwrap();
        let item = attachment_ref("C1", "A1");
        let source = FakeSource::new();
        source.put_file(&item.attachment.url, b"data");
        let processor = processor(source.clone(), dir.path());

        processor.process(&item).await.unwrap();
        let again = processor.process(&item).await.unwrap();

        assert!(matches!(again, ProcessOutcome::AlreadyPresent { .. }));
        assert_eq!(source.fetch_count(), 1);

        let files: Vec<_> = std::fs::read_dir(dir.path().join("2024-12"))
            .unwrap()
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn ids_differing_in_punctuation_are_both_downloaded() {
        let dir = tempdir().unwrap();
        let underscore = attachment_ref("C1", "A_1");
        let dotted = attachment_ref("C1", "A.1");
        let source = FakeSource::new();
        source.put_file(&underscore.attachment.url, b"first");
        source.put_file(&dotted.attachment.url, b"second");
        let processor = processor(source.clone(), dir.path());

        let first = processor.process(&underscore).await.unwrap();
        let second = processor.process(&dotted).await.unwrap();

        let month = dir.path().join("2024-12");
        assert_eq!(
            first,
            ProcessOutcome::Downloaded {
                path: month.join("invoice_A_1.pdf"),
                bytes: 5
            }
        );
        assert_eq!(
            second,
            ProcessOutcome::Downloaded {
                path: month.join("invoice_A%2E1.pdf"),
                bytes: 6
            }
        );
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn missing_remote_file_is_permanent() {
        let dir = tempdir().unwrap();
        let item = attachment_ref("C1", "A1");

        let err = processor(FakeSource::new(), dir.path())
            .process(&item)
            .await
            .unwrap_err();

        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[tokio::test]
    async fn transient_failure_is_retryable_and_writes_nothing() {
        let dir = tempdir().unwrap();
        let item = attachment_ref("C1", "A1");
        let source = FakeSource::new();
        source.fail_fetches(&item.attachment.url, SourceErrorKind::Transient, 1);

        let err = processor(source, dir.path()).process(&item).await.unwrap_err();

        assert_eq!(err.class(), FailureClass::Retryable);
        assert!(!dir.path().join("2024-12").join("invoice_A1.pdf").exists());
    }

    #[tokio::test]
    async fn invalid_metadata_is_permanent() {
        let dir = tempdir().unwrap();
        let mut item = attachment_ref("C1", "A1");
        item.attachment.url = String::new();

        let err = processor(FakeSource::new(), dir.path())
            .process(&item)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::InvalidMetadata(_)));
        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[tokio::test]
    async fn expired_url_is_refreshed_once() {
        let dir = tempdir().unwrap();
        let mut item = attachment_ref("C1", "A1");
        item.message_id = Some(MessageId::new("M1"));
        let source = FakeSource::new();
        source.fail_fetches(&item.attachment.url, SourceErrorKind::Expired, 1);
        source.put_fresh_url("M1", "A1", "https://files.example/fresh");
        source.put_file("https://files.example/fresh", b"fresh");

        let outcome = processor(source, dir.path()).process(&item).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::Downloaded { bytes: 5, .. }));
    }

    #[tokio::test]
    async fn expired_url_without_replacement_is_permanent() {
        let dir = tempdir().unwrap();
        let mut item = attachment_ref("C1", "A1");
        item.message_id = Some(MessageId::new("M1"));
        let source = FakeSource::new();
        source.fail_fetches(&item.attachment.url, SourceErrorKind::Expired, 1);

        let err = processor(source, dir.path()).process(&item).await.unwrap_err();

        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[tokio::test]
    async fn skipped_attachments_are_not_fetched() {
        let dir = tempdir().unwrap();
        let mut item = attachment_ref("C1", "A1");
        item.attachment.media_type = Some("application".into());
        item.attachment.sub_type = Some("pgp-signature".into());
        let source = FakeSource::new();

        let outcome = processor(source.clone(), dir.path())
            .with_filter(AttachmentFilter::new(FilterConfig::DEFAULT))
            .process(&item)
            .await
            .unwrap();

        assert!(matches!(outcome, ProcessOutcome::Skipped(_)));
        assert_eq!(source.fetch_count(), 0);
    }

    #[test]
    fn no_clobber_keeps_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2024-12").join("a.pdf");

        assert!(write_no_clobber(&path, b"first").unwrap());
        assert!(!write_no_clobber(&path, b"second").unwrap());

        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1, "temp file must not be left behind");
    }

    #[test]
    fn io_errors_are_retryable() {
        let err = ProcessError::Io {
            path: PathBuf::from("/full"),
            source: io::Error::other("No space left on device"),
        };
        assert_eq!(err.class(), FailureClass::Retryable);
    }
}
