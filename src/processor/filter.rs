//! Rules for attachments that are not worth downloading.
//!
//! Signatures and calendar invites are always skipped. Images are skipped
//! when they are small enough to be logos or tracking pixels.

use std::fmt;

use crate::types::Attachment;

/// `(media_type, sub_type)` pairs that are always skipped.
const SKIP_TYPES: &[(&str, &str)] = &[
    ("application", "pgp-signature"),
    ("application", "pkcs7-signature"),
    ("text", "calendar"),
    ("application", "ics"),
];

/// Thresholds for the small-image rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterConfig {
    /// Images below this many bytes are skipped.
    pub min_image_size: u64,

    /// Images with width or height below this many pixels are skipped.
    pub min_image_dimension: u32,
}

impl FilterConfig {
    pub const DEFAULT: FilterConfig = FilterConfig {
        min_image_size: 10 * 1024,
        min_image_dimension: 100,
    };
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Why an attachment was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Type { media_type: String, sub_type: String },
    ImageBytes(u64),
    ImageDimensions { width: u32, height: u32 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Type {
                media_type,
                sub_type,
            } => write!(f, "skip type: {media_type}/{sub_type}"),
            SkipReason::ImageBytes(size) => write!(f, "image too small: {size} bytes"),
            SkipReason::ImageDimensions { width, height } => {
                write!(f, "image too small: {width}x{height}px")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AttachmentFilter {
    config: FilterConfig,
}

impl AttachmentFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    /// Returns the reason to skip the attachment, or `None` to download it.
    pub fn should_skip(&self, attachment: &Attachment) -> Option<SkipReason> {
        let media_type = attachment.media_type.as_deref()?;
        let sub_type = attachment.sub_type.as_deref().unwrap_or_default();

        if SKIP_TYPES
            .iter()
            .any(|(m, s)| m.eq_ignore_ascii_case(media_type) && s.eq_ignore_ascii_case(sub_type))
        {
            return Some(SkipReason::Type {
                media_type: media_type.to_string(),
                sub_type: sub_type.to_string(),
            });
        }

        if !media_type.eq_ignore_ascii_case("image") {
            return None;
        }

        if let Some(size) = attachment.size
            && size > 0
            && size < self.config.min_image_size
        {
            return Some(SkipReason::ImageBytes(size));
        }

        if let (Some(width), Some(height)) = (attachment.width, attachment.height)
            && width > 0
            && height > 0
            && (width < self.config.min_image_dimension
                || height < self.config.min_image_dimension)
        {
            return Some(SkipReason::ImageDimensions { width, height });
        }

        None
    }
}
