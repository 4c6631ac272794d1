//! Round-trip tests: compose a message, parse it back as raw MIME and
//! decode it the way a provider message is decoded.

#![allow(clippy::unwrap_used)]

use mailweave_mime::encoding::encode_base64;
use mailweave_mime::{
    ComposeAttachment, ComposeRequest, DecodeOptions, Mailbox, ParsedEmail, charset, compose,
    parse_email, parse_raw,
};
use proptest::prelude::*;

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 13, b'I', b'H'];

fn decode(request: &ComposeRequest) -> (ParsedEmail, mailweave_mime::RawMime) {
    let composed = compose(request).unwrap();
    let raw = parse_raw(composed.raw.as_bytes()).unwrap();
    let email = parse_email(&raw.to_provider_message("local-1"), &DecodeOptions::default()).unwrap();
    (email, raw)
}

#[test]
fn test_html_only_round_trip() {
    let request = ComposeRequest::new("Grüße aus Köln", "<p>Hello <b>world</b></p>")
        .from(Mailbox::new("Alice", "alice@example.com"))
        .to(Mailbox::new("Bob", "bob@example.com"));

    let (email, _) = decode(&request);

    assert_eq!(email.subject, "Grüße aus Köln");
    assert_eq!(email.body, "<p>Hello <b>world</b></p>");
    assert_eq!(email.preview, "Hello world");
    assert_eq!(email.from.unwrap().email, "alice@example.com");
    assert_eq!(email.to, vec![Mailbox::new("Bob", "bob@example.com")]);
    assert!(email.attachments.is_empty());
    assert!(email.inline_attachments.is_empty());
}

#[test]
fn test_full_structure_round_trip() {
    let html = format!(
        "<p>Chart below</p><img src=\"data:image/png;base64,{}\">",
        encode_base64(PNG)
    );
    let request = ComposeRequest::new("Quarterly", html)
        .to(Mailbox::new("", "team@example.com"))
        .attach(ComposeAttachment::from_bytes("notes.txt", "text/plain", b"line 1\r\nline 2"))
        .attach(ComposeAttachment::from_bytes("report.pdf", "application/pdf", b"%PDF-1.4"));

    let (email, raw) = decode(&request);

    assert_eq!(raw.root.mime_type, "multipart/mixed");
    assert_eq!(raw.root.parts[0].mime_type, "multipart/related");

    // The body references the lifted image by its Content-ID.
    assert_eq!(email.inline_attachments.len(), 1);
    let cid = &email.inline_attachments[0].content_id;
    assert!(email.body.starts_with("<p>Chart below</p><img src=\"cid:"));
    assert!(email.body.contains(&format!("cid:{cid}")));

    // Only the regular attachments are listed, with their bytes intact.
    let names: Vec<&str> = email.attachments.iter().map(|a| a.filename.as_str()).collect();
    assert_eq!(names, vec!["notes.txt", "report.pdf"]);
    let pdf = &email.attachments[1];
    assert_eq!(raw.attachments[&pdf.attachment_id], b"%PDF-1.4");
    let image = &email.inline_attachments[0];
    assert_eq!(raw.attachments[&image.attachment_id], PNG);
}

#[test]
fn test_inline_attachment_with_caller_cid() {
    let request = ComposeRequest::new("Logo", "<p>Our logo</p><img src=\"cid:logo@acme\">")
        .to(Mailbox::new("", "bob@example.com"))
        .attach(ComposeAttachment::from_bytes("logo.png", "image/png", PNG).with_cid("logo@acme"));

    let (email, raw) = decode(&request);

    assert_eq!(raw.root.mime_type, "multipart/related");
    assert!(email.attachments.is_empty());
    assert_eq!(email.inline_attachments[0].content_id, "logo@acme");
    assert_eq!(email.inline_attachments[0].filename.as_deref(), Some("logo.png"));
}

#[test]
fn test_reply_headers_survive() {
    let request = ComposeRequest::new("Re: plan", "<p>ok</p>")
        .to(Mailbox::new("", "bob@example.com"))
        .in_reply_to("<root@example.com>");

    let composed = compose(&request).unwrap();
    let raw = parse_raw(composed.raw.as_bytes()).unwrap();

    assert_eq!(raw.headers.get("in-reply-to"), Some("<root@example.com>"));
    assert_eq!(
        raw.to_provider_message("x").thread_id.as_deref(),
        Some("<root@example.com>")
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_html_body_survives_round_trip(text in "[a-zA-Zа-яёÀ-ÿ€0-9 ,.!?]{0,120}") {
        let html = format!("<p>x{text}</p>");
        let request = ComposeRequest::new("prop", html.clone())
            .to(Mailbox::new("", "bob@example.com"));

        let (email, _) = decode(&request);
        prop_assert_eq!(email.body, html);
    }

    #[test]
    fn prop_declared_utf8_never_adds_replacement_chars(text in "\\PC{0,200}") {
        let decoded = charset::decode_text(text.as_bytes(), Some("text/plain; charset=UTF-8"));
        prop_assert_eq!(decoded, text);
    }
}
