//! Content transfer encodings.
//!
//! Base64 (standard and the provider's URL-safe alphabet) and
//! Quoted-Printable (RFC 2045 §6.7).

use std::fmt;
use std::fmt::Write as _;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

use crate::error::Result;

/// Maximum encoded line length (RFC 2045 §6.7 and §6.8).
pub const MAX_LINE_LENGTH: usize = 76;

/// Transfer encoding types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    /// 7-bit ASCII.
    #[default]
    SevenBit,
    /// 8-bit binary.
    EightBit,
    /// Base64 encoding.
    Base64,
    /// Quoted-Printable encoding.
    QuotedPrintable,
    /// Binary (no encoding).
    Binary,
}

impl TransferEncoding {
    /// Parses transfer encoding from a `Content-Transfer-Encoding` value.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "8bit" => Self::EightBit,
            "base64" => Self::Base64,
            "quoted-printable" => Self::QuotedPrintable,
            "binary" => Self::Binary,
            _ => Self::SevenBit,
        }
    }
}

impl fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SevenBit => write!(f, "7bit"),
            Self::EightBit => write!(f, "8bit"),
            Self::Base64 => write!(f, "base64"),
            Self::QuotedPrintable => write!(f, "quoted-printable"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

/// Encodes data as standard Base64.
#[must_use]
pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decodes standard Base64, ignoring embedded whitespace and line breaks.
///
/// # Errors
///
/// Returns an error if the input is not valid Base64.
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    let cleaned: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(cleaned).map_err(Into::into)
}

/// Encodes data with the URL-safe alphabet and no padding, as mail APIs
/// expect for raw messages.
#[must_use]
pub fn encode_base64url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decodes URL-safe Base64 as returned by mail APIs.
///
/// `-`/`_` are mapped back to `+`/`/`, the input is re-padded to a multiple
/// of four and decoded with the standard alphabet. Padded and unpadded input
/// are both accepted.
///
/// # Errors
///
/// Returns an error if the input is not valid Base64 after normalization.
pub fn decode_base64url(data: &str) -> Result<Vec<u8>> {
    let mut normalized: String = data
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    let unpadded = normalized.trim_end_matches('=').len();
    normalized.truncate(unpadded);
    while normalized.len() % 4 != 0 {
        normalized.push('=');
    }

    STANDARD.decode(normalized).map_err(Into::into)
}

/// Splits an encoded ASCII string into CRLF-delimited lines of at most
/// `width` characters.
#[must_use]
pub fn wrap_lines(encoded: &str, width: usize) -> String {
    let width = width.max(1);
    let mut wrapped = String::with_capacity(encoded.len() + encoded.len() / width * 2 + 2);
    for (i, chunk) in encoded.as_bytes().chunks(width).enumerate() {
        if i > 0 {
            wrapped.push_str("\r\n");
        }
        // Base64 output is pure ASCII, so chunking bytes never splits a char.
        wrapped.push_str(&String::from_utf8_lossy(chunk));
    }
    wrapped
}

/// Base64-encodes `data` and wraps it at 76 columns.
#[must_use]
pub fn encode_base64_wrapped(data: &[u8]) -> String {
    wrap_lines(&encode_base64(data), MAX_LINE_LENGTH)
}

/// Encodes bytes using Quoted-Printable.
///
/// The output is binary-safe: CR and LF are escaped rather than emitted as
/// hard line breaks, so `decode_quoted_printable(encode(b)) == b` for any
/// input. Lines are soft-broken to stay within 76 columns.
#[must_use]
pub fn encode_quoted_printable(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3 / 2);
    let mut line_length = 0;

    for (i, &byte) in data.iter().enumerate() {
        let is_last = i + 1 == data.len();
        let literal = match byte {
            b'!'..=b'<' | b'>'..=b'~' => true,
            // Whitespace at the very end would read as trailing padding.
            b' ' | b'\t' => !is_last,
            _ => false,
        };
        let token_length = if literal { 1 } else { 3 };

        // Keep one column free for the soft-break marker.
        if line_length + token_length > MAX_LINE_LENGTH - 1 {
            result.push_str("=\r\n");
            line_length = 0;
        }

        if literal {
            result.push(char::from(byte));
        } else {
            let _ = write!(result, "={byte:02X}");
        }
        line_length += token_length;
    }

    result
}

/// Decodes Quoted-Printable data.
///
/// Soft line breaks (`=\r\n`, `=\n`) are removed, `=XX` with valid hex
/// digits becomes the byte `XX`, and any other `=` is kept literally. Never
/// fails.
#[must_use]
pub fn decode_quoted_printable(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let byte = data[i];
        if byte != b'=' {
            result.push(byte);
            i += 1;
            continue;
        }

        let rest = &data[i + 1..];
        if rest.starts_with(b"\r\n") {
            i += 3;
        } else if rest.starts_with(b"\n") {
            i += 2;
        } else if let [hi, lo, ..] = rest
            && let (Some(hi), Some(lo)) = (hex_value(*hi), hex_value(*lo))
        {
            result.push((hi << 4) | lo);
            i += 3;
        } else {
            result.push(b'=');
            i += 1;
        }
    }

    result
}

pub(crate) const fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
