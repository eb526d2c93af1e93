//! Deterministic target paths for downloaded attachments.
//!
//! The target path is a pure function of the attachment metadata, the naming
//! strategy and the storage root, so re-processing the same item always lands
//! on the same file. Every path has the shape `{root}/{YYYY-MM}/{filename}`,
//! with the month taken from the attachment's `updated_at`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::types::{Attachment, AttachmentId};

/// Longest sanitized basename for the ID-suffixed strategy.
const MAX_BASENAME_LEN: usize = 100;

/// Longest filename produced by the participant strategy, in bytes.
const MAX_FILENAME_BYTES: usize = 240;

/// Longest extension (with its dot) kept intact when a name is truncated.
const MAX_EXTENSION_BYTES: usize = 16;

/// Placeholder for a missing sender or recipient.
const UNKNOWN_PARTICIPANT: &str = "unknown";

/// How downloaded files are named.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NamingStrategy {
    /// `{sanitized_basename}_{attachment_id}.{ext}`. Collision-free.
    #[default]
    IdSuffixed,

    /// `FROM_{sender}_TO_{recipient}_NAME_{original_filename}`.
    ParticipantAnnotated,
}

impl FromStr for NamingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "id_suffixed" | "id" => Ok(NamingStrategy::IdSuffixed),
            "participants" | "participant_annotated" => Ok(NamingStrategy::ParticipantAnnotated),
            other => Err(format!(
                "unknown naming strategy '{other}' (expected 'id_suffixed' or 'participants')"
            )),
        }
    }
}

impl fmt::Display for NamingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamingStrategy::IdSuffixed => write!(f, "id_suffixed"),
            NamingStrategy::ParticipantAnnotated => write!(f, "participants"),
        }
    }
}

/// Where and under which name an attachment is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRecord {
    pub source_filename: String,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub attachment_id: AttachmentId,
    pub target_path: PathBuf,
}

impl DownloadRecord {
    /// Computes the target path for an attachment.
    pub fn plan(root: &Path, attachment: &Attachment, strategy: NamingStrategy) -> Self {
        let filename = match strategy {
            NamingStrategy::IdSuffixed => {
                id_suffixed_filename(&attachment.filename, &attachment.id)
            }
            NamingStrategy::ParticipantAnnotated => participant_filename(
                attachment.sender.as_deref(),
                attachment.recipient.as_deref(),
                &attachment.filename,
            ),
        };

        DownloadRecord {
            source_filename: attachment.filename.clone(),
            sender: attachment.sender.clone(),
            recipient: attachment.recipient.clone(),
            attachment_id: attachment.id.clone(),
            target_path: root.join(month_folder(attachment.updated_at)).join(filename),
        }
    }
}

/// The `YYYY-MM` folder for a timestamp.
pub fn month_folder(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Builds `{sanitized_basename}_{attachment_id}.{ext}`.
///
/// Example: `Invoice December.PDF` with ID `0001f0d0` becomes
/// `Invoice-December_0001f0d0.pdf`.
///
/// The basename never contains `_` and the escaped ID never contains `.`, so
/// distinct IDs always give distinct filenames.
pub fn id_suffixed_filename(original: &str, attachment_id: &AttachmentId) -> String {
    let (name, ext) = match original.rsplit_once('.') {
        Some((name, ext)) => (name, sanitize_extension(ext)),
        None => (original, String::new()),
    };

    let name = sanitize_basename(name);
    let id = escape_id(attachment_id.as_str());

    if ext.is_empty() {
        format!("{name}_{id}")
    } else {
        format!("{name}_{id}.{ext}")
    }
}

/// Sanitizes a filename stem.
///
/// - spaces become `-`
/// - characters outside `[A-Za-z0-9._-]` become `_`
/// - runs of `-`/`_` collapse to a single `-`
/// - leading and trailing `-`/`_` are trimmed
/// - at most 100 characters; `attachment` if nothing is left
pub fn sanitize_basename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;

    for c in name.chars() {
        let c = match c {
            ' ' => '-',
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' => c,
            _ => '_',
        };
        if c == '-' || c == '_' {
            if !in_run {
                out.push('-');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }

    let trimmed = out.trim_matches(|c| c == '-' || c == '_');
    if trimmed.is_empty() {
        return "attachment".to_string();
    }
    trimmed.chars().take(MAX_BASENAME_LEN).collect()
}

/// Lowercases an extension and drops anything but ASCII alphanumerics.
fn sanitize_extension(ext: &str) -> String {
    ext.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Percent-encodes an attachment ID, `.` included.
fn escape_id(id: &str) -> String {
    urlencoding::encode(id).replace('.', "%2E")
}

/// Builds `FROM_{sender}_TO_{recipient}_NAME_{original_filename}`.
pub fn participant_filename(
    sender: Option<&str>,
    recipient: Option<&str>,
    original: &str,
) -> String {
    let sender = participant(sender);
    let recipient = participant(recipient);
    let name = if original.trim().is_empty() {
        "attachment".to_string()
    } else {
        escape_component(original)
    };

    let full = format!("FROM_{sender}_TO_{recipient}_NAME_{name}");
    if full.len() <= MAX_FILENAME_BYTES {
        return full;
    }

    // Cut the middle, keep the extension.
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() < MAX_EXTENSION_BYTES => {
            &name[stem.len()..]
        }
        _ => "",
    };
    let head = &full[..full.len() - ext.len()];
    format!("{}{ext}", truncate_bytes(head, MAX_FILENAME_BYTES - ext.len()))
}

fn participant(address: Option<&str>) -> String {
    match address.map(str::trim) {
        Some(a) if !a.is_empty() => escape_component(a),
        _ => UNKNOWN_PARTICIPANT.to_string(),
    }
}

/// `@` becomes `_at_`; path separators and NUL become `_`.
fn escape_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '@' => out.push_str("_at_"),
            '/' | '\\' | '\0' => out.push('_'),
            c => out.push(c),
        }
    }
    out
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_attachment, sample_attachment};
    use chrono::TimeZone;
    use proptest::prelude::*;

    // ─── ID-Suffixed ───

    #[test]
    fn id_suffixed_example() {
        let id = AttachmentId::new("0001f0d0-0c46-4036-84c7-c493a226a993");
        assert_eq!(
            id_suffixed_filename("Invoice December.PDF", &id),
            "Invoice-December_0001f0d0-0c46-4036-84c7-c493a226a993.pdf"
        );
    }

    #[test]
    fn id_suffixed_without_extension() {
        assert_eq!(
            id_suffixed_filename("README", &AttachmentId::new("A1")),
            "README_A1"
        );
    }

    #[test]
    fn sanitize_rules() {
        assert_eq!(sanitize_basename("a  b"), "a-b");
        assert_eq!(sanitize_basename("Über/..\\x"), "ber-..-x");
        assert_eq!(sanitize_basename("__--__"), "attachment");
        assert_eq!(sanitize_basename(""), "attachment");
        assert_eq!(sanitize_basename("-report_"), "report");
        assert_eq!(sanitize_basename(&"x".repeat(150)).len(), 100);
    }

    #[test]
    fn ids_differing_only_in_punctuation_get_distinct_names() {
        assert_eq!(
            id_suffixed_filename("invoice.pdf", &AttachmentId::new("A_1")),
            "invoice_A_1.pdf"
        );
        assert_eq!(
            id_suffixed_filename("invoice.pdf", &AttachmentId::new("A.1")),
            "invoice_A%2E1.pdf"
        );
        assert_eq!(
            id_suffixed_filename("invoice.pdf", &AttachmentId::new("A/1")),
            "invoice_A%2F1.pdf"
        );
        // An ID with a dot cannot pose as the extension of another file.
        assert_ne!(
            id_suffixed_filename("x", &AttachmentId::new("A.pdf")),
            id_suffixed_filename("x.pdf", &AttachmentId::new("A"))
        );
    }

    #[test]
    fn extension_is_lowercased_and_cleaned() {
        assert_eq!(
            id_suffixed_filename("scan.J/PG", &AttachmentId::new("A1")),
            "scan_A1.jpg"
        );
    }

    #[test]
    fn hidden_file_gets_placeholder_stem() {
        assert_eq!(
            id_suffixed_filename(".env", &AttachmentId::new("A1")),
            "attachment_A1.env"
        );
    }

    // ─── Participant-Annotated ───

    #[test]
    fn participant_example() {
        let mut attachment = sample_attachment("A1");
        attachment.filename = "invoice.pdf".to_string();
        attachment.sender = Some("a@x.com".to_string());
        attachment.recipient = Some("b@y.com".to_string());
        attachment.updated_at = Utc.with_ymd_and_hms(2024, 12, 3, 10, 0, 0).unwrap();

        let record = DownloadRecord::plan(
            Path::new("/data"),
            &attachment,
            NamingStrategy::ParticipantAnnotated,
        );

        assert_eq!(
            record.target_path,
            PathBuf::from("/data/2024-12/FROM_a_at_x.com_TO_b_at_y.com_NAME_invoice.pdf")
        );
    }

    #[test]
    fn participant_missing_addresses() {
        assert_eq!(
            participant_filename(None, Some(" "), "x/y.txt"),
            "FROM_unknown_TO_unknown_NAME_x_y.txt"
        );
    }

    #[test]
    fn participant_name_is_capped_on_char_boundary() {
        let name = "ü".repeat(200);
        let filename = participant_filename(Some("a@x.com"), Some("b@y.com"), &name);
        assert!(filename.len() <= MAX_FILENAME_BYTES);
        assert!(filename.starts_with("FROM_a_at_x.com_TO_b_at_y.com_NAME_"));
    }

    #[test]
    fn truncated_participant_name_keeps_extension() {
        let name = format!("{}.pdf", "scan".repeat(100));
        let filename = participant_filename(Some("a@x.com"), Some("b@y.com"), &name);

        assert_eq!(filename.len(), MAX_FILENAME_BYTES);
        assert!(filename.starts_with("FROM_a_at_x.com_TO_b_at_y.com_NAME_scanscan"));
        assert!(filename.ends_with(".pdf"));
    }

    #[test]
    fn truncation_on_char_boundary_keeps_extension() {
        let name = format!("{}.docx", "ü".repeat(200));
        let filename = participant_filename(None, None, &name);

        assert!(filename.len() <= MAX_FILENAME_BYTES);
        assert!(filename.ends_with("ü.docx"));
    }

    #[test]
    fn dot_names_stay_inside_the_filename() {
        assert_eq!(
            participant_filename(Some("."), Some(".."), ".."),
            "FROM_._TO_.._NAME_.."
        );
    }

    // ─── Strategy Parsing ───

    #[test]
    fn strategy_parsing() {
        assert_eq!("id_suffixed".parse(), Ok(NamingStrategy::IdSuffixed));
        assert_eq!(
            "Participants".parse(),
            Ok(NamingStrategy::ParticipantAnnotated)
        );
        assert!("random".parse::<NamingStrategy>().is_err());
    }

    // ─── Property Tests ───

    proptest! {
        #[test]
        fn plan_is_deterministic(attachment in arb_attachment()) {
            for strategy in [NamingStrategy::IdSuffixed, NamingStrategy::ParticipantAnnotated] {
                let a = DownloadRecord::plan(Path::new("/root"), &attachment, strategy);
                let b = DownloadRecord::plan(Path::new("/root"), &attachment.clone(), strategy);
                prop_assert_eq!(a, b);
            }
        }

        #[test]
        fn target_stays_in_month_folder(attachment in arb_attachment()) {
            for strategy in [NamingStrategy::IdSuffixed, NamingStrategy::ParticipantAnnotated] {
                let record = DownloadRecord::plan(Path::new("/root"), &attachment, strategy);
                let month = Path::new("/root").join(month_folder(attachment.updated_at));
                prop_assert_eq!(record.target_path.parent(), Some(month.as_path()));
                let name = record.target_path.file_name().unwrap().to_str().unwrap();
                prop_assert!(name != "." && name != "..");
            }
        }

        #[test]
        fn distinct_ids_get_distinct_id_suffixed_names(
            name_a in "\\PC{0,30}",
            name_b in "\\PC{0,30}",
            a in "\\PC{1,20}",
            b in "\\PC{1,20}",
        ) {
            prop_assume!(a != b);
            prop_assert_ne!(
                id_suffixed_filename(&name_a, &AttachmentId::new(a.clone())),
                id_suffixed_filename(&name_a, &AttachmentId::new(b.clone()))
            );
            prop_assert_ne!(
                id_suffixed_filename(&name_a, &AttachmentId::new(a)),
                id_suffixed_filename(&name_b, &AttachmentId::new(b))
            );
        }

        #[test]
        fn id_suffixed_names_are_single_components(
            name in "\\PC{0,30}",
            id in "\\PC{1,20}",
        ) {
            let filename = id_suffixed_filename(&name, &AttachmentId::new(id));
            prop_assert!(!filename.contains('/') && !filename.contains('\\'));
            prop_assert!(filename != "." && filename != "..");
        }
    }
}
