//! Part tree navigation: body selection and attachment discovery.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::part::{MAX_DEPTH, MessagePart};

#[allow(clippy::expect_used)]
static CID_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)cid:([^"'\s<>)]+)"#).expect("cid pattern is valid")
});

/// Metadata for a downloadable attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    /// Provider part id.
    pub part_id: Option<String>,
    /// Filename as sent.
    pub filename: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Id for fetching the bytes.
    pub attachment_id: String,
    /// Content-ID, if the part has one.
    pub content_id: Option<String>,
}

/// Metadata for a part that can be referenced from HTML via `cid:`.
///
/// Bytes are fetched on demand with the attachment id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineAttachment {
    /// Content-ID without angle brackets.
    pub content_id: String,
    /// Id for fetching the bytes.
    pub attachment_id: String,
    /// MIME type.
    pub mime_type: String,
    /// Filename, when the part has one.
    pub filename: Option<String>,
    /// Size in bytes.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    OtherText,
    Plain,
    Html,
}

/// Finds the part holding the message body.
///
/// HTML always wins over plain text, and the first HTML part in document
/// order is returned. Inside `multipart/alternative` this means the HTML
/// child is chosen regardless of child order; other multiparts are
/// searched child by child. A single-part message is its own body.
///
/// Below the root only `text/*` leaves with data and no filename are
/// candidates. Non-text leaves and named parts are attachments, so a
/// multipart message holding nothing but those has no body part.
#[must_use]
pub fn find_body_part(root: &MessagePart) -> Option<&MessagePart> {
    if !root.is_multipart() {
        return root.data().is_some().then_some(root);
    }
    best_in(root, 0).map(|(part, _)| part)
}

fn best_in(part: &MessagePart, depth: usize) -> Option<(&MessagePart, Rank)> {
    if !part.is_multipart() {
        return rank(part).map(|r| (part, r));
    }
    if depth >= MAX_DEPTH {
        tracing::warn!(depth, "part tree too deep, body search stopped");
        return None;
    }

    let mut best: Option<(&MessagePart, Rank)> = None;
    for child in &part.parts {
        if let Some((found, found_rank)) = best_in(child, depth + 1) {
            if found_rank == Rank::Html {
                return Some((found, found_rank));
            }
            if best.is_none_or(|(_, r)| found_rank > r) {
                best = Some((found, found_rank));
            }
        }
    }
    best
}

fn rank(part: &MessagePart) -> Option<Rank> {
    if part.data().is_none() || part.filename().is_some() {
        return None;
    }
    match part.essence().as_str() {
        "text/html" => Some(Rank::Html),
        "text/plain" => Some(Rank::Plain),
        essence if essence.starts_with("text/") => Some(Rank::OtherText),
        _ => None,
    }
}

/// Collects the Content-IDs referenced as `cid:<id>` in an HTML body.
#[must_use]
pub fn referenced_cids(html: &str) -> HashSet<String> {
    CID_REFERENCE
        .captures_iter(html)
        .map(|captures| captures[1].to_string())
        .collect()
}

/// Lists downloadable attachments.
///
/// Every part with a filename and an attachment id qualifies, except an
/// image whose Content-ID is in `referenced_cids`: that one is shown inline
/// rather than attached.
#[must_use]
pub fn extract_attachments(
    root: &MessagePart,
    referenced_cids: &HashSet<String>,
) -> Vec<AttachmentInfo> {
    root.descendants()
        .filter_map(|part| {
            let filename = part.filename()?;
            let attachment_id = part.attachment_id()?;

            if part.is_image()
                && part
                    .content_id()
                    .is_some_and(|cid| referenced_cids.contains(cid))
            {
                return None;
            }

            Some(AttachmentInfo {
                part_id: part.part_id.clone(),
                filename: filename.to_string(),
                mime_type: part.essence(),
                size: part.size(),
                attachment_id: attachment_id.to_string(),
                content_id: part.content_id().map(str::to_string),
            })
        })
        .collect()
}

/// Lists every part that carries both a Content-ID and an attachment id,
/// whatever its MIME type.
#[must_use]
pub fn extract_inline_attachments(root: &MessagePart) -> Vec<InlineAttachment> {
    root.descendants()
        .filter_map(|part| {
            Some(InlineAttachment {
                content_id: part.content_id()?.to_string(),
                attachment_id: part.attachment_id()?.to_string(),
                mime_type: part.essence(),
                filename: part.filename().map(str::to_string),
                size: part.size(),
            })
        })
        .collect()
}
