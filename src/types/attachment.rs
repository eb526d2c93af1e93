//! Attachment metadata as reported by the remote conversation API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AttachmentId, ConversationId, ItemId, MessageId};

/// A single attachment on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,

    /// Filename as sent by the author of the message.
    pub filename: String,

    /// Download URL. For Missive this is a signed URL that eventually expires.
    pub url: String,

    /// Sender address of the message carrying the attachment.
    #[serde(default)]
    pub sender: Option<String>,

    /// First recipient address of the message carrying the attachment.
    #[serde(default)]
    pub recipient: Option<String>,

    /// When the carrying message was delivered/updated. Drives the `YYYY-MM` folder.
    pub updated_at: DateTime<Utc>,

    /// MIME top-level type, e.g. `image` or `application`.
    #[serde(default)]
    pub media_type: Option<String>,

    /// MIME subtype, e.g. `pdf` or `pgp-signature`.
    #[serde(default)]
    pub sub_type: Option<String>,

    /// Size in bytes, if known.
    #[serde(default)]
    pub size: Option<u64>,

    /// Image width in pixels, if known.
    #[serde(default)]
    pub width: Option<u32>,

    /// Image height in pixels, if known.
    #[serde(default)]
    pub height: Option<u32>,
}

/// Everything a worker needs to download one attachment.
///
/// This is the payload stored in each spool entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub conversation_id: ConversationId,

    #[serde(default)]
    pub message_id: Option<MessageId>,

    pub attachment: Attachment,
}

impl AttachmentRef {
    pub fn new(
        conversation_id: ConversationId,
        message_id: Option<MessageId>,
        attachment: Attachment,
    ) -> Self {
        AttachmentRef {
            conversation_id,
            message_id,
            attachment,
        }
    }

    /// The stable queue key for this attachment.
    pub fn item_id(&self) -> ItemId {
        ItemId::for_attachment(&self.conversation_id, &self.attachment.id)
    }
}

/// A conversation returned by a listing page, with its attachments flattened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub attachments: Vec<ConversationAttachment>,
}

/// An attachment together with the message it was found on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationAttachment {
    pub message_id: Option<MessageId>,
    pub attachment: Attachment,
}

impl Conversation {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Converts every attachment into a queue payload, preserving listing order.
    pub fn attachment_refs(&self) -> impl Iterator<Item = AttachmentRef> + '_ {
        self.attachments.iter().map(|a| {
            AttachmentRef::new(self.id.clone(), a.message_id.clone(), a.attachment.clone())
        })
    }
}
