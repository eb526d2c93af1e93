//! Shared test utilities, an in-memory remote source and arbitrary generators
//! for property-based testing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use crate::source::{Page, RemoteSource, SourceError, SourceErrorKind};
use crate::types::{
    Attachment, AttachmentId, AttachmentRef, Conversation, ConversationAttachment,
    ConversationId, MessageId,
};

/// A UTC timestamp from Unix milliseconds.
pub fn ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

/// A downloadable PDF attachment updated in December 2024.
pub fn sample_attachment(id: &str) -> Attachment {
    Attachment {
        id: AttachmentId::new(id),
        filename: "invoice.pdf".to_string(),
        url: format!("https://files.example/{id}"),
        sender: Some("a@x.com".to_string()),
        recipient: Some("b@y.com".to_string()),
        updated_at: Utc.with_ymd_and_hms(2024, 12, 3, 10, 0, 0).unwrap(),
        media_type: Some("application".to_string()),
        sub_type: Some("pdf".to_string()),
        size: Some(2048),
        width: None,
        height: None,
    }
}

/// A queue payload for attachment `attachment` on conversation `conversation`.
///
/// The URL is unique per (conversation, attachment) pair.
pub fn attachment_ref(conversation: &str, attachment: &str) -> AttachmentRef {
    let mut a = sample_attachment(attachment);
    a.url = format!("https://files.example/{conversation}/{attachment}");
    AttachmentRef::new(ConversationId::new(conversation), None, a)
}

/// A conversation carrying one message per attachment, `M-{attachment}`.
pub fn conversation(id: &str, attachments: &[&str]) -> Conversation {
    Conversation {
        id: ConversationId::new(id),
        attachments: attachments
            .iter()
            .map(|a| ConversationAttachment {
                message_id: Some(MessageId::new(format!("M-{a}"))),
                attachment: attachment_ref(id, a).attachment,
            })
            .collect(),
    }
}

// ─── Fake Remote Source ───

#[derive(Default)]
struct FakeState {
    pages: Vec<Vec<Conversation>>,
    listing_failures: HashMap<usize, SourceErrorKind>,
    list_calls: Vec<(DateTime<Utc>, DateTime<Utc>, Option<String>)>,
    files: HashMap<String, Vec<u8>>,
    fetch_failures: HashMap<String, (SourceErrorKind, u32)>,
    fresh_urls: HashMap<(String, String), String>,
    fetches: usize,
}

/// An in-memory [`RemoteSource`].
///
/// Page tokens are the page index as a string. Clones share state, so a
/// test can keep a handle for setup and inspection after handing one to
/// the code under test.
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pages returned by every listing, regardless of window.
    pub fn set_pages(&self, pages: Vec<Vec<Conversation>>) {
        self.state.lock().unwrap().pages = pages;
    }

    /// Makes listing page `index` fail with `kind` until cleared.
    pub fn fail_listing_at(&self, index: usize, kind: SourceErrorKind) {
        self.state
            .lock()
            .unwrap()
            .listing_failures
            .insert(index, kind);
    }

    pub fn clear_listing_failures(&self) {
        self.state.lock().unwrap().listing_failures.clear();
    }

    pub fn put_file(&self, url: &str, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(url.to_string(), bytes.to_vec());
    }

    /// Makes the next `times` fetches of `url` fail with `kind`.
    pub fn fail_fetches(&self, url: &str, kind: SourceErrorKind, times: u32) {
        self.state
            .lock()
            .unwrap()
            .fetch_failures
            .insert(url.to_string(), (kind, times));
    }

    /// Registers the URL returned when refreshing `(message, attachment)`.
    pub fn put_fresh_url(&self, message: &str, attachment: &str, url: &str) {
        self.state.lock().unwrap().fresh_urls.insert(
            (message.to_string(), attachment.to_string()),
            url.to_string(),
        );
    }

    /// Every listing request as `(since, until, page_token)`.
    pub fn list_calls(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>, Option<String>)> {
        self.state.lock().unwrap().list_calls.clone()
    }

    /// Number of fetch attempts, successful or not.
    pub fn fetch_count(&self) -> usize {
        self.state.lock().unwrap().fetches
    }
}

impl RemoteSource for FakeSource {
    async fn list_updated_since(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<Page, SourceError> {
        let mut state = self.state.lock().unwrap();
        state
            .list_calls
            .push((since, until, page_token.map(str::to_string)));

        let index: usize = page_token.map_or(0, |t| t.parse().unwrap());
        if let Some(kind) = state.listing_failures.get(&index) {
            return Err(SourceError::new(*kind, format!("page {index} failed")));
        }

        let conversations = state.pages.get(index).cloned().unwrap_or_default();
        let next_page_token = (index + 1 < state.pages.len()).then(|| (index + 1).to_string());
        Ok(Page {
            conversations,
            next_page_token,
        })
    }

    async fn fetch_attachment_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;

        if let Some((kind, remaining)) = state.fetch_failures.get_mut(url)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(SourceError::new(*kind, format!("fetch of {url} failed")));
        }

        state
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| SourceError::not_found(format!("no file at {url}")))
    }

    async fn refresh_attachment_url(
        &self,
        message_id: &MessageId,
        attachment_id: &AttachmentId,
    ) -> Result<Option<String>, SourceError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .fresh_urls
            .get(&(
                message_id.as_str().to_string(),
                attachment_id.as_str().to_string(),
            ))
            .cloned())
    }
}

// ─── Generators ───

pub fn arb_attachment_id() -> impl Strategy<Value = AttachmentId> {
    "[a-zA-Z0-9-]{1,36}".prop_map(AttachmentId::new)
}

pub fn arb_address() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[a-z0-9.]{0,12}@[a-z]{1,8}\\.[a-z]{2,3}")
}

pub fn arb_attachment() -> impl Strategy<Value = Attachment> {
    (
        arb_attachment_id(),
        "\\PC{0,80}",
        arb_address(),
        arb_address(),
        0i64..4_102_444_800_000,
    )
        .prop_map(|(id, filename, sender, recipient, ms)| Attachment {
            url: format!("https://files.example/{id}"),
            id,
            filename,
            sender,
            recipient,
            updated_at: ts(ms),
            media_type: Some("application".to_string()),
            sub_type: Some("octet-stream".to_string()),
            size: None,
            width: None,
            height: None,
        })
}
