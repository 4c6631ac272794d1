//! # mailweave-mime
//!
//! MIME codec for a web-mail client backed by a provider REST API.
//!
//! ## Features
//!
//! - **Decoding**: provider part trees to render-ready HTML with attachment
//!   and inline-image metadata
//! - **Charsets**: declared charsets with alias resolution, plus a scoring
//!   fallback for undeclared or mislabelled text
//! - **Encoding/Decoding**: URL-safe Base64, Quoted-Printable, RFC 2047
//!   header words
//! - **Composition**: HTML compose state to a multipart message, with
//!   `data:` images lifted into `cid:` parts
//! - **Raw parsing**: RFC 5322 messages into the provider tree shape
//!
//! ## Quick Start
//!
//! ### Decoding a provider message
//!
//! ```ignore
//! use mailweave_mime::{DecodeOptions, ProviderMessage, parse_email};
//!
//! let message = ProviderMessage::from_json(&json)?;
//! let email = parse_email(&message, &DecodeOptions::default())?;
//! println!("{}: {}", email.subject, email.preview);
//! ```
//!
//! ### Composing a message
//!
//! ```ignore
//! use mailweave_mime::{ComposeAttachment, ComposeRequest, Mailbox, compose};
//!
//! let request = ComposeRequest::new("Report", "<p>See attached.</p>")
//!     .to(Mailbox::new("Bob", "bob@example.com"))
//!     .attach(ComposeAttachment::from_bytes("report.pdf", "application/pdf", &bytes));
//!
//! let message = compose(&request)?;
//! send(message.encoded);
//! ```
//!
//! ### Header words
//!
//! ```ignore
//! use mailweave_mime::header::decode_encoded_words;
//!
//! assert_eq!(decode_encoded_words("=?UTF-8?Q?Caf=C3=A9?="), "Café");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod content_type;
mod email;
mod error;
mod message;
mod part;

pub mod body;
pub mod charset;
pub mod compose;
pub mod encoding;
pub mod header;
pub mod navigator;

pub use body::{DecodeOptions, decode_part_body};
pub use charset::CharsetDecision;
pub use compose::{ComposeAttachment, ComposeRequest, ComposedMessage, Composer, compose};
pub use content_type::{ContentType, header_parameters};
pub use email::{
    LABEL_IMPORTANT, LABEL_INBOX, LABEL_STARRED, LABEL_UNREAD, ParsedEmail, ProviderMessage,
    parse_email,
};
pub use encoding::TransferEncoding;
pub use error::{Error, Result};
pub use header::{Headers, Mailbox};
pub use message::{RawMime, parse_raw};
pub use navigator::{AttachmentInfo, InlineAttachment};
pub use part::{Header, MAX_DEPTH, MessagePart, PartBody};
