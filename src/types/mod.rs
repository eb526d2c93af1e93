//! Core domain types for the attachment pipeline.

pub mod attachment;
pub mod ids;

pub use attachment::{Attachment, AttachmentRef, Conversation, ConversationAttachment};
pub use ids::{AttachmentId, ConversationId, ItemId, MessageId};
