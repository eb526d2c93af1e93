//! The remote source contract.
//!
//! The poller lists conversations through it and the processor downloads
//! attachment bytes through it. The trait-based design enables in-memory
//! fakes for testing.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::error::SourceError;
use crate::types::{AttachmentId, Conversation, MessageId};

/// One page of conversations updated within the queried window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub conversations: Vec<Conversation>,

    /// Token for the next page. `None` is the end-of-pages signal.
    pub next_page_token: Option<String>,
}

/// A remote conversation API holding the attachments to mirror.
///
/// # Example (fake for testing)
///
/// ```ignore
/// struct FakeSource { pages: Vec<Page> }
///
/// impl RemoteSource for FakeSource {
///     async fn list_updated_since(&self, _: DateTime<Utc>, _: DateTime<Utc>, token: Option<&str>)
///         -> Result<Page, SourceError>
///     {
///         let index = token.map_or(0, |t| t.parse().unwrap());
///         Ok(self.pages[index].clone())
///     }
///     // ...
/// }
/// ```
pub trait RemoteSource: Send + Sync + 'static {
    /// Lists conversations updated in `[since, until]`, one page at a time.
    ///
    /// Pass `None` for the first page and the previous page's
    /// `next_page_token` afterwards.
    fn list_updated_since(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> impl Future<Output = Result<Page, SourceError>> + Send;

    /// Downloads the bytes behind an attachment URL.
    fn fetch_attachment_bytes(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Vec<u8>, SourceError>> + Send;

    /// Asks for a fresh signed URL for an attachment whose URL expired.
    ///
    /// Returns `None` if the attachment is no longer on the message.
    fn refresh_attachment_url(
        &self,
        message_id: &MessageId,
        attachment_id: &AttachmentId,
    ) -> impl Future<Output = Result<Option<String>, SourceError>> + Send;
}

impl<S: RemoteSource> RemoteSource for Arc<S> {
    fn list_updated_since(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> impl Future<Output = Result<Page, SourceError>> + Send {
        (**self).list_updated_since(since, until, page_token)
    }

    fn fetch_attachment_bytes(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Vec<u8>, SourceError>> + Send {
        (**self).fetch_attachment_bytes(url)
    }

    fn refresh_attachment_url(
        &self,
        message_id: &MessageId,
        attachment_id: &AttachmentId,
    ) -> impl Future<Output = Result<Option<String>, SourceError>> + Send {
        (**self).refresh_attachment_url(message_id, attachment_id)
    }
}
