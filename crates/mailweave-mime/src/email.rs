//! Email assembly: provider message in, rendered email out.

use serde::{Deserialize, Serialize};

use crate::body::{DecodeOptions, decode_html_entities, decode_part_body, preview};
use crate::error::{Error, Result};
use crate::header::{Mailbox, decode_encoded_words, parse_address_list};
use crate::navigator::{
    AttachmentInfo, InlineAttachment, extract_attachments, extract_inline_attachments,
    find_body_part, referenced_cids,
};
use crate::part::MessagePart;

/// Label on messages that have not been read.
pub const LABEL_UNREAD: &str = "UNREAD";
/// Label the provider puts on messages it ranks as important.
pub const LABEL_IMPORTANT: &str = "IMPORTANT";
/// Label on starred messages.
pub const LABEL_STARRED: &str = "STARRED";
/// Label on messages shown in the inbox.
pub const LABEL_INBOX: &str = "INBOX";

/// A message as returned by the provider's "get message" call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMessage {
    /// Message id.
    pub id: String,
    /// Thread id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Labels on the message.
    #[serde(default)]
    pub label_ids: Vec<String>,
    /// Short plain-text excerpt, HTML-escaped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Receive time in epoch milliseconds, as a decimal string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_date: Option<String>,
    /// Approximate size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_estimate: Option<u64>,
    /// Root of the part tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePart>,
}

impl ProviderMessage {
    /// Deserializes a provider message from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the text is not a message object.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Into::into)
    }

    /// Returns `true` if the message carries the label.
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l == label)
    }
}

/// A decoded, render-ready email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEmail {
    /// Message id.
    pub id: String,
    /// Thread id.
    pub thread_id: Option<String>,
    /// Decoded subject.
    pub subject: String,
    /// Sender, if the message names one.
    pub from: Option<Mailbox>,
    /// Primary recipients.
    pub to: Vec<Mailbox>,
    /// Carbon-copy recipients.
    pub cc: Vec<Mailbox>,
    /// `Date` header, or the receive time when the header is missing.
    pub date: String,
    /// Body as HTML.
    pub body: String,
    /// One-line plain-text preview.
    pub preview: String,
    /// No `UNREAD` label.
    pub is_read: bool,
    /// Has the `IMPORTANT` label.
    pub is_important: bool,
    /// Has the `STARRED` label.
    pub is_starred: bool,
    /// All labels.
    pub label_ids: Vec<String>,
    /// Downloadable attachments.
    pub attachments: Vec<AttachmentInfo>,
    /// Parts that can be shown inline via `cid:`.
    pub inline_attachments: Vec<InlineAttachment>,
}

/// Decodes a provider message.
///
/// The payload is validated first; a malformed tree is an error. Past
/// that point decoding is total: an undecodable body renders as a
/// placeholder and a message without a body part gets an empty body.
///
/// # Errors
///
/// Returns [`Error::InvalidPart`] when there is no payload, or the error
/// from [`MessagePart::validate`].
pub fn parse_email(message: &ProviderMessage, options: &DecodeOptions) -> Result<ParsedEmail> {
    let payload = message.payload.as_ref().ok_or_else(|| Error::InvalidPart {
        part: "root".to_string(),
        reason: format!("message {} has no payload", message.id),
    })?;
    payload.validate()?;

    let header = |name: &str| payload.header(name).map(decode_encoded_words);

    let body = find_body_part(payload).map_or_else(String::new, |part| {
        decode_part_body(part, options)
    });

    let cids = referenced_cids(&body);
    let attachments = extract_attachments(payload, &cids);
    let inline_attachments = extract_inline_attachments(payload);

    let preview = message
        .snippet
        .as_deref()
        .filter(|snippet| !snippet.trim().is_empty())
        .map_or_else(
            || preview(&body, options.preview_chars),
            decode_html_entities,
        );

    let date = header("date")
        .filter(|date| !date.trim().is_empty())
        .or_else(|| message.internal_date.as_deref().and_then(format_internal_date))
        .unwrap_or_default();

    let parsed = ParsedEmail {
        id: message.id.clone(),
        thread_id: message.thread_id.clone(),
        subject: header("subject").unwrap_or_default(),
        from: payload
            .header("from")
            .and_then(|from| parse_address_list(from).into_iter().next()),
        to: payload.header("to").map(parse_address_list).unwrap_or_default(),
        cc: payload.header("cc").map(parse_address_list).unwrap_or_default(),
        date,
        body,
        preview,
        is_read: !message.has_label(LABEL_UNREAD),
        is_important: message.has_label(LABEL_IMPORTANT),
        is_starred: message.has_label(LABEL_STARRED),
        label_ids: message.label_ids.clone(),
        attachments,
        inline_attachments,
    };

    tracing::debug!(
        id = %parsed.id,
        attachments = parsed.attachments.len(),
        inline = parsed.inline_attachments.len(),
        "parsed email"
    );

    Ok(parsed)
}

fn format_internal_date(millis: &str) -> Option<String> {
    let millis = millis.trim().parse::<i64>().ok()?;
    chrono::DateTime::from_timestamp_millis(millis).map(|date| date.to_rfc2822())
}
