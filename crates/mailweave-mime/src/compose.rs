//! MIME message composition.
//!
//! Turns an HTML compose state into a complete RFC 2822 message. Images
//! embedded as `data:` URLs are lifted out into `cid:` parts, and the
//! multipart layout is the smallest one that fits the content:
//!
//! | inline images | attachments | structure |
//! |---|---|---|
//! | no  | no  | `alternative{plain, html}` |
//! | no  | yes | `mixed{alternative, attachment*}` |
//! | yes | no  | `related{alternative, image*}` |
//! | yes | yes | `mixed{related{alternative, image*}, attachment*}` |

use std::fmt::Write;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use rand::distributions::Alphanumeric;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::body::html_to_text;
use crate::content_type::ContentType;
use crate::encoding::{decode_base64, encode_base64_wrapped, encode_base64url};
use crate::error::{Error, Result};
use crate::header::{Headers, Mailbox, encode_rfc2047};

/// Domain used in generated Content-IDs and Message-IDs.
pub const DEFAULT_DOMAIN: &str = "mailweave.local";

const BOUNDARY_RANDOM_LEN: usize = 32;

#[allow(clippy::expect_used)]
static DATA_URL_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(<img\b[^>]*?\bsrc\s*=\s*)["']data:([a-z0-9.+-]+/[a-z0-9.+-]+);base64,([a-z0-9+/=\s]*)["']"#,
    )
    .expect("data url pattern is valid")
});

/// A file to send with a message.
///
/// With a `cid` the file is an inline image referenced from the body,
/// without one it is a regular attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeAttachment {
    /// Filename.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// Contents, standard Base64.
    pub data: String,
    /// Content-ID for inline use, without angle brackets.
    #[serde(default)]
    pub cid: Option<String>,
}

impl ComposeAttachment {
    /// Creates a regular attachment from Base64 data.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
            cid: None,
        }
    }

    /// Creates a regular attachment from raw bytes.
    #[must_use]
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::new(name, mime_type, crate::encoding::encode_base64(bytes))
    }

    /// Marks the attachment as an inline part with the given Content-ID.
    #[must_use]
    pub fn with_cid(mut self, cid: impl Into<String>) -> Self {
        self.cid = Some(cid.into());
        self
    }

    /// Returns true if this is an inline part.
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        self.cid.is_some()
    }
}

/// Everything needed to build an outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ComposeRequest {
    /// Sender. Providers usually fill this in when absent.
    pub from: Option<Mailbox>,
    /// Primary recipients.
    pub to: Vec<Mailbox>,
    /// Carbon-copy recipients.
    pub cc: Vec<Mailbox>,
    /// Blind carbon-copy recipients.
    pub bcc: Vec<Mailbox>,
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub html: String,
    /// Attachments and inline images.
    pub attachments: Vec<ComposeAttachment>,
    /// Message-ID being replied to.
    pub in_reply_to: Option<String>,
    /// Message-IDs of the thread, space separated.
    pub references: Option<String>,
}

impl ComposeRequest {
    /// Creates a request with a subject and HTML body.
    #[must_use]
    pub fn new(subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            html: html.into(),
            ..Self::default()
        }
    }

    /// Sets the sender.
    #[must_use]
    pub fn from(mut self, sender: Mailbox) -> Self {
        self.from = Some(sender);
        self
    }

    /// Adds a recipient.
    #[must_use]
    pub fn to(mut self, recipient: Mailbox) -> Self {
        self.to.push(recipient);
        self
    }

    /// Adds a CC recipient.
    #[must_use]
    pub fn cc(mut self, recipient: Mailbox) -> Self {
        self.cc.push(recipient);
        self
    }

    /// Adds a BCC recipient.
    #[must_use]
    pub fn bcc(mut self, recipient: Mailbox) -> Self {
        self.bcc.push(recipient);
        self
    }

    /// Adds an attachment or inline image.
    #[must_use]
    pub fn attach(mut self, attachment: ComposeAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Marks the message as a reply. `References` defaults to the same id.
    #[must_use]
    pub fn in_reply_to(mut self, message_id: impl Into<String>) -> Self {
        let message_id = message_id.into();
        if self.references.is_none() {
            self.references = Some(message_id.clone());
        }
        self.in_reply_to = Some(message_id);
        self
    }

    /// Sets the `References` chain.
    #[must_use]
    pub fn references(mut self, references: impl Into<String>) -> Self {
        self.references = Some(references.into());
        self
    }

    /// Returns true if the message has at least one recipient.
    #[must_use]
    pub fn has_recipients(&self) -> bool {
        !(self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty())
    }
}

/// A fully assembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    /// The RFC 2822 message text.
    pub raw: String,
    /// `raw` as unpadded URL-safe Base64, ready for transport.
    pub encoded: String,
    /// Boundaries in use, outermost first.
    pub boundaries: Vec<String>,
    /// The generated Message-ID, with angle brackets.
    pub message_id: String,
}

/// Builds outgoing messages.
///
/// Holds the domain for generated ids and the counter that keeps
/// Content-IDs unique across the messages it composes.
#[derive(Debug)]
pub struct Composer {
    domain: String,
    counter: AtomicU64,
}

impl Default for Composer {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN)
    }
}

struct InlineImage {
    cid: String,
    mime_type: String,
    name: String,
    bytes: Vec<u8>,
}

enum Node {
    Leaf(String),
    Multipart {
        sub_type: &'static str,
        children: Vec<Self>,
    },
}

impl Composer {
    /// Creates a composer that generates ids under `domain`.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Returns the id domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Composes a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Structure`] when there are no recipients, when an
    /// address or reference contains a line break, or when the body is
    /// blank and nothing is attached. Returns a decode error if
    /// an attachment's data is not valid Base64.
    pub fn compose(&self, request: &ComposeRequest) -> Result<ComposedMessage> {
        if !request.has_recipients() {
            return Err(Error::Structure("no recipients".to_string()));
        }
        check_header_values(request)?;

        let (html, mut inline) = self.extract_data_urls(&request.html);

        let mut regular = Vec::new();
        for attachment in &request.attachments {
            let bytes = decode_base64(&attachment.data)?;
            match &attachment.cid {
                Some(cid) => inline.push(InlineImage {
                    cid: cid.trim_start_matches('<').trim_end_matches('>').to_string(),
                    mime_type: attachment.mime_type.clone(),
                    name: attachment.name.clone(),
                    bytes,
                }),
                None => regular.push((attachment, bytes)),
            }
        }

        let plain = html_to_text(&html);
        if plain.is_empty() && inline.is_empty() && regular.is_empty() {
            return Err(Error::Structure(
                "message has no body and no attachments".to_string(),
            ));
        }

        let alternative = Node::Multipart {
            sub_type: "alternative",
            children: vec![
                Node::Leaf(text_leaf(&ContentType::text_plain(), &plain)),
                Node::Leaf(text_leaf(&ContentType::text_html(), &html)),
            ],
        };

        let content = if inline.is_empty() {
            alternative
        } else {
            let mut children = vec![alternative];
            children.extend(inline.iter().map(|image| Node::Leaf(inline_leaf(image))));
            Node::Multipart {
                sub_type: "related",
                children,
            }
        };

        let root = if regular.is_empty() {
            content
        } else {
            let mut children = vec![content];
            children.extend(
                regular
                    .iter()
                    .map(|(attachment, bytes)| Node::Leaf(attachment_leaf(attachment, bytes))),
            );
            Node::Multipart {
                sub_type: "mixed",
                children,
            }
        };

        let message_id = self.message_id();
        let headers = message_headers(request, &message_id);
        let header_text = headers.to_string();

        let mut corpus = vec![header_text.as_str()];
        root.collect_leaves(&mut corpus);
        let mut boundaries = Vec::new();
        let mut raw = header_text.clone();
        root.render(&corpus, &mut boundaries, &mut raw);

        tracing::debug!(
            inline = inline.len(),
            attachments = regular.len(),
            boundaries = boundaries.len(),
            bytes = raw.len(),
            "composed message"
        );

        Ok(ComposedMessage {
            encoded: encode_base64url(raw.as_bytes()),
            raw,
            boundaries,
            message_id,
        })
    }

    /// Replaces `data:` image sources with `cid:` references and returns the
    /// rewritten HTML plus the extracted images. Sources whose payload is
    /// not valid Base64 are left alone.
    fn extract_data_urls(&self, html: &str) -> (String, Vec<InlineImage>) {
        let mut images = Vec::new();
        let rewritten = DATA_URL_IMAGE.replace_all(html, |captures: &Captures<'_>| {
            let Ok(bytes) = decode_base64(&captures[3]) else {
                tracing::warn!("skipping data url image with invalid base64");
                return captures[0].to_string();
            };
            let mime_type = captures[2].to_ascii_lowercase();
            let cid = self.content_id();
            let extension = mime_type.rsplit('/').next().unwrap_or("bin");
            images.push(InlineImage {
                name: format!("image{}.{extension}", images.len() + 1),
                cid: cid.clone(),
                mime_type,
                bytes,
            });
            format!("{}\"cid:{cid}\"", &captures[1])
        });
        (rewritten.into_owned(), images)
    }

    fn content_id(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "{counter}-{}@{}",
            chrono::Utc::now().timestamp_millis(),
            self.domain
        )
    }

    fn message_id(&self) -> String {
        format!(
            "<{}.{}@{}>",
            chrono::Utc::now().timestamp_millis(),
            random_alphanumeric(16),
            self.domain
        )
    }
}

/// Rejects values that would be written into a header verbatim and carry a
/// line break. Subjects and file names are RFC 2047 encoded and need no
/// check.
fn check_header_values(request: &ComposeRequest) -> Result<()> {
    let mailboxes = request
        .from
        .iter()
        .chain(&request.to)
        .chain(&request.cc)
        .chain(&request.bcc)
        .flat_map(|mailbox| {
            [
                ("address", mailbox.email.as_str()),
                ("display name", mailbox.name.as_str()),
            ]
        });
    let references = [
        ("In-Reply-To", request.in_reply_to.as_deref()),
        ("References", request.references.as_deref()),
    ]
    .into_iter()
    .filter_map(|(field, value)| Some((field, value?)));
    let parts = request.attachments.iter().flat_map(|attachment| {
        [
            ("attachment type", Some(attachment.mime_type.as_str())),
            ("Content-ID", attachment.cid.as_deref()),
        ]
        .into_iter()
        .filter_map(|(field, value)| Some((field, value?)))
    });

    for (field, value) in mailboxes.chain(references).chain(parts) {
        if value.contains(['\r', '\n']) {
            return Err(Error::Structure(format!("line break in {field}")));
        }
    }
    Ok(())
}

fn message_headers(request: &ComposeRequest, message_id: &str) -> Headers {
    let mut headers = Headers::new();
    if let Some(from) = &request.from {
        headers.add("From", from.to_string());
    }
    for (name, list) in [("To", &request.to), ("Cc", &request.cc), ("Bcc", &request.bcc)] {
        if !list.is_empty() {
            headers.add(name, join_mailboxes(list));
        }
    }
    headers.add("Subject", encode_rfc2047(&request.subject));
    if let Some(in_reply_to) = &request.in_reply_to {
        headers.add("In-Reply-To", in_reply_to.clone());
    }
    if let Some(references) = &request.references {
        headers.add("References", references.clone());
    }
    headers.add("Date", chrono::Utc::now().to_rfc2822());
    headers.add("Message-ID", message_id);
    headers.add("MIME-Version", "1.0");
    headers
}

/// Composes a message with a default [`Composer`].
///
/// # Errors
///
/// See [`Composer::compose`].
pub fn compose(request: &ComposeRequest) -> Result<ComposedMessage> {
    Composer::default().compose(request)
}

impl Node {
    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Leaf(text) => out.push(text),
            Self::Multipart { children, .. } => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }

    fn render(&self, corpus: &[&str], boundaries: &mut Vec<String>, out: &mut String) {
        match self {
            Self::Leaf(text) => out.push_str(text),
            Self::Multipart { sub_type, children } => {
                let boundary = generate_boundary(corpus, boundaries);
                boundaries.push(boundary.clone());

                let content_type = ContentType::multipart(*sub_type, boundary.as_str());
                let _ = write!(out, "Content-Type: {content_type}\r\n\r\n");
                for child in children {
                    let _ = write!(out, "--{boundary}\r\n");
                    child.render(corpus, boundaries, out);
                    out.push_str("\r\n");
                }
                let _ = write!(out, "--{boundary}--\r\n");
            }
        }
    }
}

/// Generates a boundary that appears in none of the rendered parts and
/// differs from the boundaries already chosen.
fn generate_boundary(corpus: &[&str], taken: &[String]) -> String {
    loop {
        let candidate = format!(
            "----=_Part_{}_{}",
            chrono::Utc::now().timestamp_millis(),
            random_alphanumeric(BOUNDARY_RANDOM_LEN)
        );
        let collides = corpus.iter().any(|text| text.contains(&candidate))
            || taken.iter().any(|b| b.contains(&candidate) || candidate.contains(b.as_str()));
        if !collides {
            return candidate;
        }
        tracing::debug!("boundary collided with content, regenerating");
    }
}

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn join_mailboxes(list: &[Mailbox]) -> String {
    list.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn leaf(headers: &Headers, bytes: &[u8]) -> String {
    format!("{headers}\r\n{}", encode_base64_wrapped(bytes))
}

fn text_leaf(content_type: &ContentType, text: &str) -> String {
    let mut headers = Headers::new();
    headers.add("Content-Type", content_type.to_string());
    headers.add("Content-Transfer-Encoding", "base64");
    leaf(&headers, text.as_bytes())
}

fn file_content_type(mime_type: &str, name: &str) -> String {
    ContentType::parse(mime_type)
        .unwrap_or_else(|_| ContentType::new("application", "octet-stream"))
        .with_parameter("name", encode_rfc2047(name))
        .to_string()
}

fn disposition(kind: &str, name: &str) -> String {
    format!(
        "{kind}; filename=\"{}\"",
        encode_rfc2047(name).replace('"', "\\\"")
    )
}

fn inline_leaf(image: &InlineImage) -> String {
    let mut headers = Headers::new();
    headers.add("Content-Type", file_content_type(&image.mime_type, &image.name));
    headers.add("Content-Transfer-Encoding", "base64");
    headers.add("Content-ID", format!("<{}>", image.cid));
    headers.add("Content-Disposition", disposition("inline", &image.name));
    leaf(&headers, &image.bytes)
}

fn attachment_leaf(attachment: &ComposeAttachment, bytes: &[u8]) -> String {
    let mut headers = Headers::new();
    headers.add(
        "Content-Type",
        file_content_type(&attachment.mime_type, &attachment.name),
    );
    headers.add("Content-Transfer-Encoding", "base64");
    headers.add("Content-Disposition", disposition("attachment", &attachment.name));
    leaf(&headers, bytes)
}
