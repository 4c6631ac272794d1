//! Charset resolution for text bodies and encoded words.
//!
//! A declared charset is trusted when a decoder exists for it and the bytes
//! decode cleanly. Otherwise the bytes are decoded with every candidate in
//! [`FALLBACK_CANDIDATES`] and the most plausible result wins.

use encoding_rs::{Encoding, KOI8_R, UTF_8, WINDOWS_1251, WINDOWS_1252};

/// Candidate order for the fallback scorer, after the declared charset.
pub const FALLBACK_CANDIDATES: [&str; 5] =
    ["utf-8", "windows-1251", "windows-1252", "iso-8859-1", "koi8-r"];

const ALIASES: &[(&str, &str)] = &[
    ("utf8", "utf-8"),
    ("utf-8", "utf-8"),
    ("latin1", "iso-8859-1"),
    ("latin-1", "iso-8859-1"),
    ("l1", "iso-8859-1"),
    ("iso8859-1", "iso-8859-1"),
    ("iso_8859-1", "iso-8859-1"),
    ("iso-8859-1", "iso-8859-1"),
    ("cp1252", "windows-1252"),
    ("win-1252", "windows-1252"),
    ("windows1252", "windows-1252"),
    ("cp1251", "windows-1251"),
    ("win-1251", "windows-1251"),
    ("windows1251", "windows-1251"),
    ("koi8r", "koi8-r"),
    ("ascii", "us-ascii"),
    ("us-ascii", "us-ascii"),
];

/// Outcome of the fallback scorer.
#[derive(Debug, Clone, PartialEq)]
pub struct CharsetDecision {
    /// Decoded text.
    pub text: String,
    /// Charset that produced `text`.
    pub charset: String,
    /// Plausibility score in `[0, 1]`. Advisory only.
    pub confidence: f32,
}

/// Extracts the `charset` parameter from a `Content-Type` value, lower-cased.
///
/// Accepts quoted and bare values and any parameter-name casing.
#[must_use]
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        (!value.is_empty()).then(|| value.to_ascii_lowercase())
    })
}

/// Maps common charset aliases to their canonical label.
///
/// Unknown labels are returned lower-cased and trimmed.
#[must_use]
pub fn resolve_alias(label: &str) -> String {
    let label = label.trim().to_ascii_lowercase();
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == label)
        .map_or(label, |(_, canonical)| (*canonical).to_string())
}

/// Returns `true` if a decoder exists for the label (after alias resolution).
#[must_use]
pub fn is_supported(label: &str) -> bool {
    Decoder::for_label(label).is_some()
}

/// Decodes a text body whose charset comes from a `Content-Type` header.
#[must_use]
pub fn decode_text(bytes: &[u8], content_type: Option<&str>) -> String {
    let declared = content_type.and_then(charset_from_content_type);
    decode_with_charset(bytes, declared.as_deref())
}

/// Decodes bytes in the given charset, falling back to the scorer when the
/// charset is missing, unknown, or does not fit the bytes.
///
/// Never fails; the last resort is lossy UTF-8.
#[must_use]
pub fn decode_with_charset(bytes: &[u8], charset: Option<&str>) -> String {
    if let Some(label) = charset {
        if let Some(decoder) = Decoder::for_label(label) {
            if let Some(text) = decoder.decode_strict(bytes) {
                return text;
            }
            tracing::debug!(charset = label, "declared charset does not fit body, scoring candidates");
        } else {
            tracing::debug!(charset = label, "unsupported charset, scoring candidates");
        }
    }

    decode_with_fallback(bytes, charset).text
}

/// Runs the fallback scorer over the declared charset (if decodable) and the
/// [`FALLBACK_CANDIDATES`], returning the most plausible decoding.
#[must_use]
pub fn decode_with_fallback(bytes: &[u8], declared: Option<&str>) -> CharsetDecision {
    let mut candidates: Vec<Decoder> = Vec::with_capacity(FALLBACK_CANDIDATES.len() + 1);
    for label in declared.into_iter().chain(FALLBACK_CANDIDATES) {
        if let Some(decoder) = Decoder::for_label(label)
            && !candidates.contains(&decoder)
        {
            candidates.push(decoder);
        }
    }

    let mut best: Option<CharsetDecision> = None;
    for decoder in candidates {
        let text = decoder.decode_lossy(bytes);
        let confidence = plausibility(&text);
        if best.as_ref().is_none_or(|b| confidence > b.confidence) {
            best = Some(CharsetDecision {
                text,
                charset: decoder.name().to_string(),
                confidence,
            });
        }
    }

    let decision = best.unwrap_or_else(|| CharsetDecision {
        text: String::from_utf8_lossy(bytes).into_owned(),
        charset: "utf-8".to_string(),
        confidence: 0.0,
    });
    tracing::debug!(
        charset = %decision.charset,
        confidence = decision.confidence,
        "charset chosen by fallback scorer"
    );
    decision
}

/// A resolved decoder. ISO-8859-1 is kept separate from windows-1252
/// because the WHATWG tables behind `encoding_rs` fold the two together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoder {
    Latin1,
    Whatwg(&'static Encoding),
}

impl Decoder {
    fn for_label(label: &str) -> Option<Self> {
        let canonical = resolve_alias(label);
        match canonical.as_str() {
            "iso-8859-1" => Some(Self::Latin1),
            "utf-8" => Some(Self::Whatwg(UTF_8)),
            "windows-1251" => Some(Self::Whatwg(WINDOWS_1251)),
            "windows-1252" => Some(Self::Whatwg(WINDOWS_1252)),
            "koi8-r" => Some(Self::Whatwg(KOI8_R)),
            other => Encoding::for_label(other.as_bytes())
                // The replacement encoding decodes everything to U+FFFD.
                .filter(|encoding| encoding.name() != "replacement")
                .map(Self::Whatwg),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Latin1 => "iso-8859-1",
            Self::Whatwg(encoding) if encoding == UTF_8 => "utf-8",
            Self::Whatwg(encoding) if encoding == KOI8_R => "koi8-r",
            Self::Whatwg(encoding) => encoding.name(),
        }
    }

    fn decode_strict(self, bytes: &[u8]) -> Option<String> {
        match self {
            Self::Latin1 => Some(latin1(bytes)),
            Self::Whatwg(encoding) => {
                let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
                (!had_errors).then(|| text.into_owned())
            }
        }
    }

    fn decode_lossy(self, bytes: &[u8]) -> String {
        match self {
            Self::Latin1 => latin1(bytes),
            Self::Whatwg(encoding) => encoding.decode_without_bom_handling(bytes).0.into_owned(),
        }
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Scores how much `text` looks like real prose.
///
/// Starts from the share of readable characters (ASCII, Latin, Cyrillic,
/// general punctuation) and subtracts penalties for replacement characters,
/// UTF-8-read-as-Latin-1 digraphs, and words whose letters look like
/// Cyrillic or Western text decoded with the wrong single-byte table.
#[allow(clippy::cast_precision_loss)]
fn plausibility(text: &str) -> f32 {
    let total = text.chars().count();
    if total == 0 {
        return 1.0;
    }

    let mut readable = 0usize;
    let mut replacements = 0usize;
    for c in text.chars() {
        match c {
            '\u{FFFD}' => replacements += 1,
            c if c.is_ascii_graphic() || c.is_ascii_whitespace() => readable += 1,
            '\u{00A0}'..='\u{017F}' | '\u{0400}'..='\u{04FF}' | '\u{2010}'..='\u{2046}' | '\u{20AC}' => {
                readable += 1;
            }
            _ => {}
        }
    }

    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();
    let suspicious = words.iter().filter(|w| is_suspicious_word(w)).count();

    let total = total as f32;
    let mut score = readable as f32 / total;
    score -= 2.0 * replacements as f32 / total;
    score -= 4.0 * mojibake_pairs(text) as f32 / total;
    if !words.is_empty() {
        score -= 0.5 * suspicious as f32 / words.len() as f32;
    }
    score.clamp(0.0, 1.0)
}

/// Counts digraphs typical of UTF-8 decoded as Latin-1 / windows-1252:
/// a lead byte rendered as `Â`, `Ã`, `Ð` or `Ñ` followed by a continuation
/// byte rendered in U+0080..=U+00BF.
fn mojibake_pairs(text: &str) -> usize {
    text.chars()
        .zip(text.chars().skip(1))
        .filter(|(lead, next)| {
            matches!(lead, 'Â' | 'Ã' | 'Ð' | 'Ñ') && ('\u{0080}'..='\u{00BF}').contains(next)
        })
        .count()
}

fn is_suspicious_word(word: &str) -> bool {
    let is_cyrillic = |c: char| ('\u{0400}'..='\u{04FF}').contains(&c);
    let has_ascii = word.chars().any(|c| c.is_ascii_alphabetic());
    let has_cyrillic = word.chars().any(is_cyrillic);

    // Western text read through a Cyrillic table, e.g. "cafй".
    if has_ascii && has_cyrillic {
        return true;
    }

    // Cyrillic read through a Western table, e.g. "Ïðèâåò".
    if !has_ascii && word.chars().count() >= 3 && word.chars().all(|c| ('\u{00C0}'..='\u{00FF}').contains(&c))
    {
        return true;
    }

    // KOI8-R and windows-1251 disagree mostly on case: "пРИВЕТ".
    has_cyrillic
        && word
            .chars()
            .zip(word.chars().skip(1))
            .any(|(a, b)| a.is_lowercase() && b.is_uppercase())
}
