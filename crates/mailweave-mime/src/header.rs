//! Header handling: RFC 2047 encoded words, address lists and raw header
//! blocks.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::charset;
use crate::encoding::{decode_base64url, encode_base64, hex_value};

/// Longest encoded word allowed by RFC 2047 §2.
const MAX_ENCODED_WORD: usize = 75;

/// Input bytes per `=?UTF-8?B?...?=` word: 63 Base64 columns hold 45 bytes.
const ENCODED_WORD_BYTES: usize = 45;

#[allow(clippy::expect_used)]
static ENCODED_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\?([^?\s]+)\?([BbQq])\?([^?\s]*)\?=").expect("encoded-word pattern is valid")
});

/// Decodes every RFC 2047 encoded word in a header value.
///
/// Text outside encoded words passes through unchanged, and whitespace
/// between two adjacent encoded words is dropped (RFC 2047 §6.2). A word
/// with an unknown charset or malformed payload is left as-is.
#[must_use]
pub fn decode_encoded_words(value: &str) -> String {
    let mut decoded = String::with_capacity(value.len());
    let mut last_end = 0;
    let mut after_word = false;

    for captures in ENCODED_WORD.captures_iter(value) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let gap = &value[last_end..whole.start()];

        if let Some(text) = decode_word(&captures[1], &captures[2], &captures[3]) {
            if !(after_word && gap.chars().all(char::is_whitespace)) {
                decoded.push_str(gap);
            }
            decoded.push_str(&text);
            after_word = true;
        } else {
            tracing::debug!(word = whole.as_str(), "leaving undecodable encoded word as-is");
            decoded.push_str(gap);
            decoded.push_str(whole.as_str());
            after_word = false;
        }

        last_end = whole.end();
    }

    decoded.push_str(&value[last_end..]);
    decoded
}

fn decode_word(charset: &str, encoding: &str, payload: &str) -> Option<String> {
    // RFC 2231 allows a language suffix: utf-8*en
    let charset = charset.split('*').next().unwrap_or(charset);
    if !charset::is_supported(charset) {
        return None;
    }

    let bytes = if encoding.eq_ignore_ascii_case("B") {
        decode_base64url(payload).ok()?
    } else {
        decode_q(payload)?
    };

    Some(charset::decode_with_charset(&bytes, Some(charset)))
}

/// Strict `Q` decoding: `_` is a space and every `=` must start a valid
/// hex escape.
fn decode_q(payload: &str) -> Option<Vec<u8>> {
    let bytes = payload.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                decoded.push(b' ');
                i += 1;
            }
            b'=' => {
                let hi = hex_value(*bytes.get(i + 1)?)?;
                let lo = hex_value(*bytes.get(i + 2)?)?;
                decoded.push((hi << 4) | lo);
                i += 3;
            }
            other => {
                decoded.push(other);
                i += 1;
            }
        }
    }
    Some(decoded)
}

/// Encodes a header value with RFC 2047 `B` words when it is not plain
/// ASCII.
///
/// Long values are split on character boundaries into several words, folded
/// onto continuation lines.
#[must_use]
pub fn encode_rfc2047(text: &str) -> String {
    let needs_encoding = text
        .chars()
        .any(|c| !(c.is_ascii_graphic() || c == ' ' || c == '\t'))
        || text.contains("=?");
    if !needs_encoding {
        return text.to_string();
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in text.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
            words.push(encoded_word(&chunk));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(encoded_word(&chunk));
    }

    words.join("\r\n ")
}

fn encoded_word(chunk: &str) -> String {
    let word = format!("=?UTF-8?B?{}?=", encode_base64(chunk.as_bytes()));
    debug_assert!(word.len() <= MAX_ENCODED_WORD);
    word
}

/// A display name and address, as found in `From`/`To`/`Cc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mailbox {
    /// Display name. Defaults to the local part of the address.
    pub name: String,
    /// Email address.
    pub email: String,
}

impl Mailbox {
    /// Creates a mailbox; an empty name becomes the address's local part.
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        let email = email.into();
        let mut name = name.into();
        if name.trim().is_empty() {
            name = local_part(&email).to_string();
        }
        Self { name, email }
    }

    /// Parses `Name <email>`, `"Name" <email>`, `<email>` or a bare address.
    ///
    /// Encoded words in the display name are decoded. Returns `None` for
    /// empty input.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        if let Some(open) = input.rfind('<')
            && let Some(close) = input[open..].find('>')
        {
            let email = input[open + 1..open + close].trim();
            let name = input[..open].trim().trim_matches('"').trim();
            let name = decode_encoded_words(&name.replace("\\\"", "\""));
            return Some(Self::new(name, email));
        }

        let email = input.trim_matches(|c| c == '"' || c == '\'');
        Some(Self::new(String::new(), email))
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() || self.name == local_part(&self.email) {
            return write!(f, "<{}>", self.email);
        }

        if !self.name.is_ascii() {
            return write!(f, "{} <{}>", encode_rfc2047(&self.name), self.email);
        }

        if self.name.contains(|c: char| "()<>[]:;@\\,.\"".contains(c)) {
            let escaped = self.name.replace('\\', "\\\\").replace('"', "\\\"");
            write!(f, "\"{escaped}\" <{}>", self.email)
        } else {
            write!(f, "{} <{}>", self.name, self.email)
        }
    }
}

fn local_part(email: &str) -> &str {
    email.split_once('@').map_or(email, |(local, _)| local)
}

/// Parses a comma-separated address list.
///
/// Commas inside quoted display names or angle brackets do not split.
#[must_use]
pub fn parse_address_list(value: &str) -> Vec<Mailbox> {
    let mut mailboxes = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut escaped = false;

    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                escaped = true;
                current.push(c);
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '<' if !in_quotes => {
                in_angle = true;
                current.push(c);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(c);
            }
            ',' if !in_quotes && !in_angle => {
                mailboxes.extend(Mailbox::parse(&current));
                current.clear();
            }
            _ => current.push(c),
        }
    }
    mailboxes.extend(Mailbox::parse(&current));

    mailboxes
}

/// Ordered, case-insensitive collection of header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Creates a new empty header collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header field.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Sets a header value, replacing any existing values.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.fields.push((name, value.into()));
    }

    /// Gets the first value for a header.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Gets all values for a header.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Removes all values for a header.
    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns an iterator over all fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parses a raw header block.
    ///
    /// Folded continuation lines (leading space or tab) are joined with a
    /// single space. Parsing stops at the first empty line; lines without a
    /// colon are skipped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut headers = Self::new();
        let mut current: Option<(String, String)> = None;

        for line in text.lines() {
            if line.is_empty() {
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, value)) = current.as_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }

            if let Some((name, value)) = current.take() {
                headers.add(name, value);
            }
            if let Some((name, value)) = line.split_once(':') {
                current = Some((name.trim().to_string(), value.trim().to_string()));
            }
        }

        if let Some((name, value)) = current {
            headers.add(name, value);
        }

        headers
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_b_word() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?SGVsbG8=?= World"), "Hello World");
    }

    #[test]
    fn test_decode_q_word() {
        assert_eq!(decode_encoded_words("=?UTF-8?Q?Caf=C3=A9?="), "Café");
        assert_eq!(decode_encoded_words("=?utf-8?q?a_b?="), "a b");
    }

    #[test]
    fn test_q_word_with_bad_escape_stays_literal() {
        assert_eq!(decode_encoded_words("=?utf-8?Q?=+F?="), "=?utf-8?Q?=+F?=");
        assert_eq!(decode_encoded_words("=?utf-8?Q?=-1?="), "=?utf-8?Q?=-1?=");
        assert_eq!(decode_encoded_words("=?utf-8?Q?ab=4?="), "=?utf-8?Q?ab=4?=");
    }

    #[test]
    fn test_decode_mixed_runs() {
        assert_eq!(
            decode_encoded_words("Re: =?utf-8?B?SMOpbGxv?= and more"),
            "Re: Héllo and more"
        );
    }

    #[test]
    fn test_adjacent_words_join() {
        assert_eq!(
            decode_encoded_words("=?UTF-8?Q?Hel?= \r\n =?UTF-8?Q?lo?="),
            "Hello"
        );
    }

    #[test]
    fn test_decode_legacy_charset() {
        assert_eq!(decode_encoded_words("=?iso-8859-1?Q?caf=E9?="), "café");
        assert_eq!(decode_encoded_words("=?koi8-r?B?zcnS?="), "мир");
    }

    #[test]
    fn test_decode_failures_are_left_untouched() {
        let unknown = "=?x-klingon?Q?abc?=";
        assert_eq!(decode_encoded_words(unknown), unknown);

        let bad_hex = "=?UTF-8?Q?caf=ZZ?=";
        assert_eq!(decode_encoded_words(bad_hex), bad_hex);

        let bad_b64 = "=?UTF-8?B?a?= tail";
        assert_eq!(decode_encoded_words(bad_b64), bad_b64);
    }

    #[test]
    fn test_encode_rfc2047() {
        assert_eq!(encode_rfc2047("Hello"), "Hello");

        let encoded = encode_rfc2047("Héllo");
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert_eq!(decode_encoded_words(&encoded), "Héllo");
    }

    #[test]
    fn test_encode_rfc2047_long_value_splits() {
        let text = "Привет ".repeat(20);
        let encoded = encode_rfc2047(&text);
        assert!(encoded.contains("\r\n "));
        for word in encoded.split("\r\n ") {
            assert!(word.len() <= MAX_ENCODED_WORD);
        }
        let unfolded = encoded.replace("\r\n ", " ");
        assert_eq!(decode_encoded_words(&unfolded), text);
    }

    #[test]
    fn test_mailbox_parse() {
        let mailbox = Mailbox::parse("Alice Smith <alice@example.com>").unwrap();
        assert_eq!(mailbox.name, "Alice Smith");
        assert_eq!(mailbox.email, "alice@example.com");

        let quoted = Mailbox::parse("\"Smith, Bob\" <bob@example.com>").unwrap();
        assert_eq!(quoted.name, "Smith, Bob");
    }

    #[test]
    fn test_mailbox_missing_name_defaults_to_local_part() {
        let bare = Mailbox::parse("carol@example.com").unwrap();
        assert_eq!(bare.name, "carol");
        let angle = Mailbox::parse("<dave@example.com>").unwrap();
        assert_eq!(angle.name, "dave");
        assert!(Mailbox::parse("   ").is_none());
    }

    #[test]
    fn test_mailbox_encoded_name() {
        let mailbox = Mailbox::parse("=?UTF-8?Q?Ren=C3=A9?= <rene@example.com>").unwrap();
        assert_eq!(mailbox.name, "René");
    }

    #[test]
    fn test_mailbox_display() {
        assert_eq!(Mailbox::new("Alice", "alice@example.com").to_string(), "Alice <alice@example.com>");
        assert_eq!(Mailbox::new("", "bob@example.com").to_string(), "<bob@example.com>");
        assert_eq!(
            Mailbox::new("Smith, Bob", "bob@example.com").to_string(),
            "\"Smith, Bob\" <bob@example.com>"
        );
        let encoded = Mailbox::new("René", "rene@example.com").to_string();
        assert_eq!(Mailbox::parse(&encoded).unwrap().name, "René");
    }

    #[test]
    fn test_parse_address_list() {
        let list = parse_address_list(
            "Alice <alice@example.com>, \"Smith, Bob\" <bob@example.com>,carol@example.com, ",
        );
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].email, "alice@example.com");
        assert_eq!(list[1].name, "Smith, Bob");
        assert_eq!(list[2].name, "carol");
    }

    #[test]
    fn test_headers_case_insensitive_and_ordered() {
        let mut headers = Headers::new();
        headers.add("To", "alice@example.com");
        headers.add("Subject", "Test");
        headers.add("to", "bob@example.com");
        assert_eq!(headers.get("TO"), Some("alice@example.com"));
        assert_eq!(headers.get_all("To").len(), 2);

        headers.set("To", "carol@example.com");
        assert_eq!(headers.get_all("to"), vec!["carol@example.com"]);
        assert_eq!(headers.to_string(), "Subject: Test\r\nTo: carol@example.com\r\n");
    }

    #[test]
    fn test_headers_parse_folding() {
        let text = concat!(
            "From: sender@example.com\r\n",
            "Subject: Test\r\n",
            "Content-Type: text/plain;\r\n",
            "\tcharset=utf-8\r\n",
            "\r\n",
            "Body: not a header\r\n"
        );

        let headers = Headers::parse(text);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(headers.get("body"), None);
    }
}
