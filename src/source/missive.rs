//! Missive REST API client.
//!
//! Conversations are listed newest-first and paged backwards in time with the
//! `until` parameter: the oldest `last_activity_at` of a full page becomes the
//! next page token. Paging stops once activity falls below `since`. For every
//! conversation reporting attachments its recent messages are listed to
//! obtain the attachment metadata and signed download URLs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use super::client::{Page, RemoteSource};
use super::error::{SourceError, SourceErrorKind, StatusPolicy, parse_retry_after};
use super::retry::{RetryConfig, retry_with_backoff};
use crate::types::{
    Attachment, AttachmentId, Conversation, ConversationAttachment, ConversationId, MessageId,
};

/// Public API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://public.missiveapp.com/v1";

/// Conversations requested per page.
const PAGE_SIZE: usize = 50;

/// Messages inspected per conversation.
const MESSAGES_PER_CONVERSATION: usize = 10;

/// Longest error body kept in error messages.
const MAX_BODY_LEN: usize = 300;

/// A Missive API client.
#[derive(Clone)]
pub struct MissiveClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    policy: StatusPolicy,
    retry: RetryConfig,
}

impl MissiveClient {
    /// Creates a client authenticating with a personal API token.
    pub fn new(
        token: impl Into<String>,
        base_url: impl Into<String>,
        request_timeout: Duration,
        policy: StatusPolicy,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("attachment-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            policy,
            retry: RetryConfig::DEFAULT,
        })
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, SourceError>
    where
        T: DeserializeOwned + Send,
    {
        let url = format!("{}{}", self.base_url, path);
        retry_with_backoff(self.retry, || self.get_json_once(&url, query))
            .await
            .into_result()
    }

    async fn get_json_once<T>(&self, url: &str, query: &[(&str, String)]) -> Result<T, SourceError>
    where
        T: DeserializeOwned + Send,
    {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(e, &self.policy))?;
        let response = self.check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::from_reqwest(e, &self.policy))
    }

    async fn fetch_bytes_once(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(e, &self.policy))?;
        let response = self.check_status(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::from_reqwest(e, &self.policy))?;
        Ok(bytes.to_vec())
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, SourceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(MAX_BODY_LEN)
            .collect();
        let message = match status.canonical_reason() {
            Some(reason) if body.is_empty() => reason.to_string(),
            _ => body,
        };

        Err(SourceError::from_status(status.as_u16(), &self.policy, message)
            .with_retry_after(retry_after))
    }

    async fn conversation_attachments(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ConversationAttachment>, SourceError> {
        let path = format!("/conversations/{}/messages", urlencoding::encode(conversation_id.as_str()));
        let response: MessagesResponse = self
            .get_json(&path, &[("limit", MESSAGES_PER_CONVERSATION.to_string())])
            .await?;

        Ok(response
            .messages
            .into_iter()
            .flat_map(|message| message.into_attachments())
            .collect())
    }
}

impl std::fmt::Debug for MissiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MissiveClient")
            .field("base_url", &self.base_url)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RemoteSource for MissiveClient {
    #[instrument(skip_all, fields(%since, %until, page_token = ?page_token))]
    async fn list_updated_since(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<Page, SourceError> {
        let upper = match page_token {
            Some(token) => token.parse::<i64>().map_err(|_| {
                SourceError::new(SourceErrorKind::Rejected, format!("invalid page token: {token}"))
            })?,
            None => until.timestamp(),
        };

        let response: ConversationsResponse = self
            .get_json(
                "/conversations",
                &[
                    ("inbox", "true".to_string()),
                    ("limit", PAGE_SIZE.to_string()),
                    ("until", upper.to_string()),
                ],
            )
            .await?;

        let page = plan_page(&response.conversations, since.timestamp(), upper);

        let mut conversations = Vec::new();
        for summary in page.in_window {
            let id = ConversationId::new(summary.id.clone());
            if summary.attachments_count == Some(0) {
                continue;
            }
            let attachments = self.conversation_attachments(&id).await?;
            let conversation = Conversation { id, attachments };
            if conversation.has_attachments() {
                conversations.push(conversation);
            }
        }

        debug!(
            listed = response.conversations.len(),
            with_attachments = conversations.len(),
            next = ?page.next_page_token,
            "Listed conversations page"
        );

        Ok(Page {
            conversations,
            next_page_token: page.next_page_token,
        })
    }

    async fn fetch_attachment_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        retry_with_backoff(self.retry, || self.fetch_bytes_once(url))
            .await
            .into_result()
    }

    async fn refresh_attachment_url(
        &self,
        message_id: &MessageId,
        attachment_id: &AttachmentId,
    ) -> Result<Option<String>, SourceError> {
        let path = format!("/messages/{}", urlencoding::encode(message_id.as_str()));
        let response: MessageResponse = self.get_json(&path, &[]).await?;

        let url = response
            .messages
            .attachments
            .into_iter()
            .find(|a| a.id == attachment_id.as_str())
            .and_then(|a| a.url);

        match &url {
            Some(_) => info!(%attachment_id, "Got fresh attachment URL"),
            None => warn!(%attachment_id, %message_id, "Attachment not found on message"),
        }
        Ok(url)
    }
}

/// Which conversations of a listing fall into the window, and where to continue.
struct PlannedPage<'a> {
    in_window: Vec<&'a ConversationSummary>,
    next_page_token: Option<String>,
}

/// Filters a newest-first listing to `last_activity_at >= since` and computes
/// the next `until` token.
///
/// A short page, or one reaching below `since`, is the last page. The token
/// always moves strictly backwards so paging terminates even if a full page
/// shares a single timestamp.
fn plan_page(listing: &[ConversationSummary], since: i64, upper: i64) -> PlannedPage<'_> {
    let in_window: Vec<_> = listing
        .iter()
        .filter(|c| c.last_activity_at as i64 >= since)
        .collect();

    let oldest = listing
        .iter()
        .map(|c| c.last_activity_at as i64)
        .min();

    let next_page_token = match oldest {
        Some(oldest) if listing.len() >= PAGE_SIZE && oldest >= since => {
            let next = if oldest >= upper { upper - 1 } else { oldest };
            Some(next.to_string())
        }
        _ => None,
    };

    PlannedPage {
        in_window,
        next_page_token,
    }
}

// ─── Wire Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConversationsResponse {
    #[serde(default)]
    conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Deserialize)]
struct ConversationSummary {
    id: String,
    /// Unix seconds.
    last_activity_at: f64,
    #[serde(default)]
    attachments_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    messages: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    /// Unix seconds.
    #[serde(default)]
    delivered_at: Option<f64>,
    /// Unix seconds.
    #[serde(default)]
    created_at: Option<f64>,
    #[serde(default)]
    from_field: Option<WireAddress>,
    #[serde(default)]
    to_fields: Vec<WireAddress>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

#[derive(Debug, Deserialize)]
struct WireAddress {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    id: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    sub_type: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

impl WireMessage {
    /// When the message was delivered, else created, else the Unix epoch.
    ///
    /// Only message fields are used so an attachment always lands in the
    /// same month folder.
    fn timestamp(&self) -> DateTime<Utc> {
        self.delivered_at
            .or(self.created_at)
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Converts the message's attachments into domain attachments.
    ///
    /// Missing filenames and URLs are kept as empty strings so the processor
    /// can dead-letter them as invalid metadata instead of losing them here.
    fn into_attachments(self) -> Vec<ConversationAttachment> {
        let updated_at = self.timestamp();
        let message_id = MessageId::new(self.id);
        if updated_at == DateTime::<Utc>::UNIX_EPOCH && !self.attachments.is_empty() {
            warn!(%message_id, "Message has no timestamp, filing attachments under 1970-01");
        }
        let sender = self.from_field.and_then(|f| f.address);
        let recipient = self.to_fields.into_iter().find_map(|f| f.address);

        self.attachments
            .into_iter()
            .map(|a| ConversationAttachment {
                message_id: Some(message_id.clone()),
                attachment: Attachment {
                    id: AttachmentId::new(a.id),
                    filename: a.filename.unwrap_or_default(),
                    url: a.url.unwrap_or_default(),
                    sender: sender.clone(),
                    recipient: recipient.clone(),
                    updated_at,
                    media_type: a.media_type,
                    sub_type: a.sub_type,
                    size: a.size,
                    width: a.width,
                    height: a.height,
                },
            })
            .collect()
    }
}
