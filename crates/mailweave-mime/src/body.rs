//! Body assembly: turns a body part into renderable HTML.
//!
//! The pipeline runs in a fixed order: URL-safe Base64, Quoted-Printable,
//! charset, HTML entities, and finally line breaks for plain text. It is
//! total: a body that cannot be decoded renders as a placeholder naming the
//! encoding and charset involved.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::charset;
use crate::encoding::{TransferEncoding, decode_base64url, decode_quoted_printable};
use crate::error::Result;
use crate::part::MessagePart;

/// Named entities decoded in bodies. `&amp;` must stay last so that an
/// escaped entity such as `&amp;lt;` is not decoded twice.
const NAMED_ENTITIES: [(&str, &str); 12] = [
    ("&nbsp;", "\u{a0}"),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&apos;", "'"),
    ("&euro;", "€"),
    ("&pound;", "£"),
    ("&yen;", "¥"),
    ("&copy;", "©"),
    ("&reg;", "®"),
    ("&trade;", "™"),
    ("&amp;", "&"),
];

#[allow(clippy::expect_used)]
static NUMERIC_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&#(?:[xX]([0-9a-fA-F]{1,6})|([0-9]{1,7}));").expect("entity pattern is valid")
});

#[allow(clippy::expect_used)]
static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|head)\b.*?</(script|style|head)\s*>").expect("block pattern is valid")
});

#[allow(clippy::expect_used)]
static BLOCK_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|tr|li|h[1-6])\s*>").expect("break pattern is valid")
});

#[allow(clippy::expect_used)]
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"));

#[allow(clippy::expect_used)]
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t\u{a0}]*(\n[ \t\u{a0}]*)+").expect("blank line pattern is valid"));

/// Default preview length in characters.
pub const DEFAULT_PREVIEW_CHARS: usize = 200;

/// Options for the body decoding pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Quoted-Printable-decode every `text/html` part, whatever its declared
    /// transfer encoding.
    ///
    /// This is a heuristic for providers that hand out already-decoded data
    /// under a missing or wrong `Content-Transfer-Encoding`. It can corrupt
    /// correctly labelled HTML that happens to contain `=XX` sequences, so
    /// it is off by default.
    pub force_qp_for_html: bool,
    /// Length of the preview built when the provider sends no snippet.
    pub preview_chars: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeOptions {
    /// Creates the default options.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            force_qp_for_html: false,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    /// Enables or disables the Quoted-Printable heuristic for HTML parts.
    #[must_use]
    pub const fn force_qp_for_html(mut self, enabled: bool) -> Self {
        self.force_qp_for_html = enabled;
        self
    }

    /// Sets the fallback preview length.
    #[must_use]
    pub const fn preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }
}

/// Decodes a body part into renderable HTML.
///
/// Never fails; undecodable input yields a placeholder string.
#[must_use]
pub fn decode_part_body(part: &MessagePart, options: &DecodeOptions) -> String {
    match try_decode_part_body(part, options) {
        Ok(html) => html,
        Err(error) => {
            let placeholder = placeholder(part);
            tracing::warn!(
                %error,
                part_id = part.part_id.as_deref().unwrap_or("root"),
                "body decoding failed, rendering placeholder"
            );
            placeholder
        }
    }
}

fn try_decode_part_body(part: &MessagePart, options: &DecodeOptions) -> Result<String> {
    let raw = decode_base64url(part.data().unwrap_or_default())?;

    let bytes = if needs_quoted_printable(part, options) {
        decode_quoted_printable(&raw)
    } else {
        raw
    };

    let text = charset::decode_text(&bytes, part.header("content-type"));
    let text = decode_html_entities(&text);

    if part.is("text/plain") {
        Ok(plain_text_to_html(&text))
    } else {
        Ok(text)
    }
}

fn needs_quoted_printable(part: &MessagePart, options: &DecodeOptions) -> bool {
    part.transfer_encoding() == TransferEncoding::QuotedPrintable
        || (options.force_qp_for_html && part.is("text/html"))
}

fn placeholder(part: &MessagePart) -> String {
    let charset = part
        .header("content-type")
        .and_then(charset::charset_from_content_type)
        .unwrap_or_else(|| "unspecified".to_string());
    format!(
        "[Unable to decode message body (encoding: {}, charset: {charset})]",
        part.transfer_encoding()
    )
}

/// Decodes numeric character references and a fixed table of named
/// entities.
///
/// References naming an invalid code point are left as written.
#[must_use]
pub fn decode_html_entities(text: &str) -> String {
    let numeric = NUMERIC_ENTITY.replace_all(text, |captures: &Captures<'_>| {
        let code_point = captures.get(1).map_or_else(
            || captures.get(2).and_then(|d| d.as_str().parse::<u32>().ok()),
            |hex| u32::from_str_radix(hex.as_str(), 16).ok(),
        );
        code_point
            .and_then(char::from_u32)
            .map_or_else(|| captures[0].to_string(), String::from)
    });

    NAMED_ENTITIES
        .iter()
        .fold(numeric.into_owned(), |acc, (entity, replacement)| {
            acc.replace(entity, replacement)
        })
}

/// Converts plain-text line breaks (`\r\n`, then `\n`, then `\r`) to
/// `<br>`.
#[must_use]
pub fn plain_text_to_html(text: &str) -> String {
    text.replace("\r\n", "<br>")
        .replace('\n', "<br>")
        .replace('\r', "<br>")
}

/// Derives a plain-text rendering of an HTML body.
///
/// Scripts, styles and the document head are dropped, line-level elements
/// become line breaks, remaining tags are stripped, entities (including
/// `&nbsp;`) are decoded and the result is trimmed.
#[must_use]
pub fn html_to_text(html: &str) -> String {
    let without_blocks = SCRIPT_OR_STYLE.replace_all(html, "");
    let with_breaks = BLOCK_BREAK.replace_all(&without_blocks, "\n");
    let stripped = TAG.replace_all(&with_breaks, "");
    let decoded = decode_html_entities(&stripped).replace('\u{a0}', " ");
    let normalized = decoded.replace("\r\n", "\n");
    BLANK_LINES
        .replace_all(&normalized, "\n\n")
        .trim()
        .to_string()
}

/// Builds a single-line preview of at most `max_chars` characters.
#[must_use]
pub fn preview(html: &str, max_chars: usize) -> String {
    let text = html_to_text(html);
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut truncated: String = collapsed.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}
