//! Raw RFC 5322 message parsing.
//!
//! Reads a message as it travels on the wire (an `.eml` file, the output of
//! the composer) into the same [`MessagePart`] tree a mail API returns, so
//! that one decode path serves both.

use std::collections::HashMap;

use crate::charset;
use crate::content_type::{ContentType, header_parameters};
use crate::email::ProviderMessage;
use crate::encoding::{TransferEncoding, decode_base64, decode_quoted_printable, encode_base64url};
use crate::error::{Error, Result};
use crate::header::{Headers, decode_encoded_words};
use crate::part::{Header, MAX_DEPTH, MessagePart, PartBody};

/// A parsed raw message.
#[derive(Debug, Clone, Default)]
pub struct RawMime {
    /// Top-level headers.
    pub headers: Headers,
    /// Part tree shaped like a provider payload.
    pub root: MessagePart,
    /// Bytes of every part that was given a synthetic attachment id.
    pub attachments: HashMap<String, Vec<u8>>,
    /// Size of the raw message in bytes.
    pub size: usize,
}

impl RawMime {
    /// Wraps the tree in a provider message with the given id.
    ///
    /// The thread id is taken from the message's own `Message-ID`, or from
    /// the first entry of `References` for replies.
    #[must_use]
    pub fn to_provider_message(&self, id: impl Into<String>) -> ProviderMessage {
        let thread_id = self
            .headers
            .get("references")
            .and_then(|refs| refs.split_whitespace().next())
            .or_else(|| self.headers.get("message-id"))
            .map(|id| id.trim().to_string());

        ProviderMessage {
            id: id.into(),
            thread_id,
            size_estimate: u64::try_from(self.size).ok(),
            payload: Some(self.root.clone()),
            ..ProviderMessage::default()
        }
    }
}

/// Parses a raw message.
///
/// Leaf bodies become URL-safe Base64 of their bytes after Base64 transfer
/// decoding. Quoted-Printable text is kept encoded, since the body pipeline
/// decodes it whenever the part says so. Parts with a filename or a
/// Content-ID get the attachment id `att-{partId}` instead of inline data,
/// and their decoded bytes are kept in [`RawMime::attachments`].
///
/// # Errors
///
/// Returns an error for a multipart without a boundary or without any
/// delimited part, an undecodable Base64 body, or nesting deeper than the
/// traversal bound.
pub fn parse_raw(bytes: &[u8]) -> Result<RawMime> {
    let (header_bytes, body) = split_head(bytes);
    let headers = Headers::parse(&decode_header_block(header_bytes));

    let mut attachments = HashMap::new();
    let root = build_part(&headers, body, String::new(), 0, &mut attachments)?;

    tracing::debug!(
        parts = root.descendants().count(),
        attachments = attachments.len(),
        "parsed raw message"
    );

    Ok(RawMime {
        headers,
        root,
        attachments,
        size: bytes.len(),
    })
}

fn build_part(
    headers: &Headers,
    body: &[u8],
    part_id: String,
    depth: usize,
    attachments: &mut HashMap<String, Vec<u8>>,
) -> Result<MessagePart> {
    if depth > MAX_DEPTH {
        return Err(Error::DepthExceeded(MAX_DEPTH));
    }

    let content_type = headers
        .get("content-type")
        .and_then(|value| match ContentType::parse(value) {
            Ok(ct) => Some(ct),
            Err(error) => {
                tracing::warn!(%error, "unparseable content type, assuming text/plain");
                None
            }
        })
        .unwrap_or_else(|| ContentType::new("text", "plain"));

    let mut part = MessagePart {
        part_id: Some(part_id.clone()),
        mime_type: content_type.essence(),
        filename: None,
        headers: headers.iter().map(|(name, value)| Header::new(name, value)).collect(),
        body: None,
        parts: Vec::new(),
    };

    if content_type.is_multipart() {
        let boundary = content_type.boundary().ok_or(Error::MissingBoundary)?;
        for (index, section) in split_multipart(body, boundary)?.into_iter().enumerate() {
            let (child_head, child_body) = split_head(section);
            let child_headers = Headers::parse(&decode_header_block(child_head));
            let child_id = if part_id.is_empty() {
                index.to_string()
            } else {
                format!("{part_id}.{index}")
            };
            part.parts.push(build_part(
                &child_headers,
                child_body,
                child_id,
                depth + 1,
                attachments,
            )?);
        }
        part.body = Some(PartBody {
            size: Some(0),
            ..PartBody::default()
        });
        return Ok(part);
    }

    let encoding = headers
        .get("content-transfer-encoding")
        .map_or(TransferEncoding::SevenBit, TransferEncoding::parse);
    let filename = filename(headers, &content_type);
    let has_content_id = headers.get("content-id").is_some();

    if filename.is_some() || has_content_id {
        let decoded = transfer_decode(body, encoding)?;
        let attachment_id = format!(
            "att-{}",
            if part_id.is_empty() { "root" } else { &part_id }
        );
        part.body = Some(PartBody {
            attachment_id: Some(attachment_id.clone()),
            size: u64::try_from(decoded.len()).ok(),
            data: None,
        });
        attachments.insert(attachment_id, decoded);
    } else {
        let stored = if encoding == TransferEncoding::QuotedPrintable {
            body.to_vec()
        } else {
            transfer_decode(body, encoding)?
        };
        part.body = Some(PartBody {
            attachment_id: None,
            size: u64::try_from(stored.len()).ok(),
            data: Some(encode_base64url(&stored)),
        });
    }
    part.filename = filename;

    Ok(part)
}

fn transfer_decode(body: &[u8], encoding: TransferEncoding) -> Result<Vec<u8>> {
    match encoding {
        TransferEncoding::Base64 => decode_base64(&String::from_utf8_lossy(body)),
        TransferEncoding::QuotedPrintable => Ok(decode_quoted_printable(body)),
        _ => Ok(body.to_vec()),
    }
}

/// Filename from `Content-Disposition`, falling back to the `name`
/// parameter of `Content-Type`.
fn filename(headers: &Headers, content_type: &ContentType) -> Option<String> {
    headers
        .get("content-disposition")
        .and_then(|value| {
            header_parameters(value)
                .into_iter()
                .find(|(key, _)| key == "filename")
                .map(|(_, value)| value)
        })
        .or_else(|| content_type.name().map(str::to_string))
        .map(|name| decode_encoded_words(&name))
        .filter(|name| !name.trim().is_empty())
}

/// Header blocks are usually ASCII; 8-bit bytes go through the charset
/// fallback instead of being replaced.
fn decode_header_block(bytes: &[u8]) -> String {
    std::str::from_utf8(bytes).map_or_else(
        |_| charset::decode_text(bytes, None),
        str::to_string,
    )
}

/// Splits an entity at the first empty line.
fn split_head(bytes: &[u8]) -> (&[u8], &[u8]) {
    let mut offset = 0;
    for line in bytes.split_inclusive(|&b| b == b'\n') {
        let start = offset;
        offset += line.len();
        if line == b"\r\n" || line == b"\n" {
            return (&bytes[..start], &bytes[offset..]);
        }
    }
    (bytes, &[])
}

/// Splits a multipart body into the sections between delimiter lines.
///
/// The line break before a delimiter belongs to the delimiter. A missing
/// closing delimiter is tolerated.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>> {
    let open = format!("--{boundary}");
    let close = format!("--{boundary}--");

    let mut sections = Vec::new();
    let mut current: Option<usize> = None;
    let mut offset = 0;
    let mut closed = false;

    for line in body.split_inclusive(|&b| b == b'\n') {
        let start = offset;
        offset += line.len();
        let trimmed = line.trim_ascii_end();

        let is_close = trimmed == close.as_bytes();
        if is_close || trimmed == open.as_bytes() {
            if let Some(section_start) = current {
                sections.push(strip_line_break(&body[section_start..start]));
            }
            if is_close {
                closed = true;
                break;
            }
            current = Some(offset);
        }
    }

    if !closed && let Some(section_start) = current {
        tracing::warn!(boundary, "multipart missing closing delimiter");
        sections.push(&body[section_start..]);
    }

    if sections.is_empty() {
        return Err(Error::InvalidMultipart(format!(
            "no parts delimited by {boundary:?}"
        )));
    }
    Ok(sections)
}

fn strip_line_break(section: &[u8]) -> &[u8] {
    section
        .strip_suffix(b"\r\n")
        .or_else(|| section.strip_suffix(b"\n"))
        .unwrap_or(section)
}
