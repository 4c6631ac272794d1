//! Provider MIME part tree.
//!
//! Mail APIs return a message as a JSON tree of parts, each with a MIME type,
//! headers and either inline body data (URL-safe Base64), a reference to
//! separately fetched attachment bytes, or child parts. [`MessagePart`]
//! deserializes that shape and [`MessagePart::validate`] rejects trees that
//! do not follow it.

use serde::{Deserialize, Serialize};

use crate::content_type::ContentType;
use crate::encoding::TransferEncoding;
use crate::error::{Error, Result};

/// Maximum nesting depth accepted for a part tree.
pub const MAX_DEPTH: usize = 50;

/// A single header field as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Field name, in the provider's casing.
    pub name: String,
    /// Raw (possibly RFC 2047 encoded) value.
    pub value: String,
}

impl Header {
    /// Creates a header field.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Body of a part: inline data or a reference to attachment bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    /// Id for fetching the bytes separately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    /// Decoded size in bytes, as reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// URL-safe Base64 content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// One node of a message's MIME tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    /// Provider part id, e.g. `"0"` or `"1.2"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
    /// MIME type without parameters, e.g. `"text/html"`.
    #[serde(default)]
    pub mime_type: String,
    /// Attachment filename. Providers send `""` for non-attachments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Header fields in wire order.
    #[serde(default)]
    pub headers: Vec<Header>,
    /// Leaf body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<PartBody>,
    /// Child parts of a multipart node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<MessagePart>,
}

impl MessagePart {
    /// Creates a leaf part with inline URL-safe Base64 data.
    #[must_use]
    pub fn leaf(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            body: Some(PartBody {
                data: Some(data.into()),
                ..PartBody::default()
            }),
            ..Self::default()
        }
    }

    /// Creates a multipart node (`multipart/{sub_type}`).
    #[must_use]
    pub fn multipart(sub_type: &str, parts: Vec<Self>) -> Self {
        Self {
            mime_type: format!("multipart/{sub_type}"),
            parts,
            ..Self::default()
        }
    }

    /// Adds a header field.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    /// Returns the first value of a header (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Lower-cased MIME type without parameters.
    #[must_use]
    pub fn essence(&self) -> String {
        let mime = self.mime_type.split(';').next().unwrap_or_default();
        mime.trim().to_ascii_lowercase()
    }

    /// Returns `true` if the essence matches `mime` (case-insensitive).
    #[must_use]
    pub fn is(&self, mime: &str) -> bool {
        self.essence().eq_ignore_ascii_case(mime)
    }

    /// Returns `true` for `multipart/*` nodes.
    #[must_use]
    pub fn is_multipart(&self) -> bool {
        self.essence().starts_with("multipart/")
    }

    /// Returns `true` for `image/*` parts.
    #[must_use]
    pub fn is_image(&self) -> bool {
        self.essence().starts_with("image/")
    }

    /// Parsed `Content-Type` header, falling back to the bare MIME type.
    #[must_use]
    pub fn content_type(&self) -> Option<ContentType> {
        self.header("content-type")
            .and_then(|value| ContentType::parse(value).ok())
            .or_else(|| ContentType::parse(&self.mime_type).ok())
    }

    /// Declared `Content-Transfer-Encoding`.
    #[must_use]
    pub fn transfer_encoding(&self) -> TransferEncoding {
        self.header("content-transfer-encoding")
            .map_or(TransferEncoding::SevenBit, TransferEncoding::parse)
    }

    /// `Content-ID` with surrounding angle brackets removed.
    #[must_use]
    pub fn content_id(&self) -> Option<&str> {
        self.header("content-id")
            .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').trim())
            .filter(|id| !id.is_empty())
    }

    /// Non-empty filename.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref().filter(|name| !name.is_empty())
    }

    /// Inline body data, if any.
    #[must_use]
    pub fn data(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|body| body.data.as_deref())
            .filter(|data| !data.is_empty())
    }

    /// Attachment id, if the bytes live outside the tree.
    #[must_use]
    pub fn attachment_id(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|body| body.attachment_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Reported body size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.body.as_ref().and_then(|body| body.size).unwrap_or(0)
    }

    /// Iterates the tree in document order (pre-order, depth-first).
    ///
    /// Nodes deeper than [`MAX_DEPTH`] are not visited.
    #[must_use]
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants {
            stack: vec![(self, 0)],
        }
    }

    /// Checks the tree against the provider schema.
    ///
    /// Each node needs a `type/subtype` MIME type; a multipart node needs
    /// children and no inline data; a leaf may carry inline data or an
    /// attachment id but not both. Nesting beyond [`MAX_DEPTH`] is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPart`] or [`Error::DepthExceeded`] for the
    /// first offending node.
    pub fn validate(&self) -> Result<()> {
        let mut stack = vec![(self, 0usize)];

        while let Some((part, depth)) = stack.pop() {
            if depth > MAX_DEPTH {
                return Err(Error::DepthExceeded(MAX_DEPTH));
            }

            let invalid = |reason: &str| Error::InvalidPart {
                part: part.part_id.clone().unwrap_or_else(|| "root".to_string()),
                reason: reason.to_string(),
            };

            let essence = part.essence();
            match essence.split_once('/') {
                Some((main, sub)) if !main.is_empty() && !sub.is_empty() => {}
                _ => return Err(invalid("missing or malformed mimeType")),
            }

            if part.is_multipart() {
                if part.parts.is_empty() {
                    return Err(invalid("multipart node has no child parts"));
                }
                if part.data().is_some() {
                    return Err(invalid("multipart node carries inline data"));
                }
            } else {
                if !part.parts.is_empty() && part.data().is_some() {
                    return Err(invalid("leaf carries both inline data and child parts"));
                }
                if part.data().is_some() && part.attachment_id().is_some() {
                    return Err(invalid("leaf carries both inline data and an attachment id"));
                }
            }

            stack.extend(part.parts.iter().map(|child| (child, depth + 1)));
        }

        Ok(())
    }
}

/// Pre-order iterator returned by [`MessagePart::descendants`].
#[derive(Debug)]
pub struct Descendants<'a> {
    stack: Vec<(&'a MessagePart, usize)>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a MessagePart;

    fn next(&mut self) -> Option<Self::Item> {
        let (part, depth) = self.stack.pop()?;
        if depth < MAX_DEPTH {
            self.stack
                .extend(part.parts.iter().rev().map(|child| (child, depth + 1)));
        } else if !part.parts.is_empty() {
            tracing::warn!(depth, "part tree too deep, skipping nested parts");
        }
        Some(part)
    }
}
