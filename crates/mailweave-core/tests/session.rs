//! Session tests against the in-memory provider.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use mailweave_core::{
    Error, MailSession, ManualClock, MemoryProvider, Operation, ProviderError, SchedulerConfig,
    SchedulerError, SessionConfig,
};
use mailweave_mime::encoding::encode_base64;
use mailweave_mime::{ComposeRequest, InlineAttachment, Mailbox, compose};

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 13];

fn raw(id: &str, subject: &str, references: Option<&str>) -> String {
    let references = references
        .map(|r| format!("References: {r}\r\n"))
        .unwrap_or_default();
    format!(
        "From: Alice <alice@example.com>\r\n\
         To: bob@example.com\r\n\
         Subject: {subject}\r\n\
         Message-ID: <{id}@example.com>\r\n\
         {references}\
         MIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         hello from {id}\r\n"
    )
}

fn mailbox() -> MemoryProvider {
    let provider = MemoryProvider::new();
    provider
        .insert_raw("m1", raw("m1", "Plan", None).as_bytes(), &["INBOX", "UNREAD"])
        .unwrap();
    provider
        .insert_raw(
            "m2",
            raw("m2", "Re: Plan", Some("<m1@example.com>")).as_bytes(),
            &["INBOX", "UNREAD"],
        )
        .unwrap();
    provider
        .insert_raw("m3", raw("m3", "Lunch", None).as_bytes(), &["INBOX", "UNREAD"])
        .unwrap();
    provider
}

fn config() -> SessionConfig {
    SessionConfig::new().scheduler(
        SchedulerConfig::new()
            .min_dispatch_delay(Duration::ZERO)
            .base_delay(Duration::from_millis(100)),
    )
}

fn session(provider: MemoryProvider) -> (MailSession<MemoryProvider>, Arc<ManualClock>) {
    let clock = ManualClock::shared();
    let session = MailSession::with_clock(provider, config(), clock.clone());
    (session, clock)
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

#[tokio::test]
async fn test_fetch_message_decodes() {
    let (session, _) = session(mailbox());

    let email = session.fetch_message("m2").await.unwrap();

    assert_eq!(email.subject, "Re: Plan");
    assert_eq!(email.thread_id.as_deref(), Some("<m1@example.com>"));
    assert_eq!(email.from, Some(Mailbox::new("Alice", "alice@example.com")));
    assert!(email.body.contains("hello from m2"));
    assert!(!email.is_read);
}

#[tokio::test]
async fn test_fetch_messages_keeps_input_order() {
    let (session, _) = session(mailbox());

    let results = session.fetch_messages(&ids(&["m3", "missing", "m1"])).await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().subject, "Lunch");
    assert_eq!(
        results[1].as_ref().unwrap_err().provider_error().map(|e| e.status),
        Some(404)
    );
    assert_eq!(results[2].as_ref().unwrap().subject, "Plan");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_fetches_share_one_call() {
    let provider = mailbox().with_latency(Duration::from_millis(50));
    let session = MailSession::new(provider, config());

    let (a, b) = tokio::join!(session.fetch_message("m1"), session.fetch_message("m1"));

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(session.provider().calls(Operation::GetMessage), 1);
}

#[tokio::test]
async fn test_rate_limited_fetch_backs_off() {
    let provider = mailbox();
    for _ in 0..3 {
        provider.fail_next(Operation::GetMessage, ProviderError::new(429, "quota"));
    }
    let (session, clock) = session(provider);

    let email = session.fetch_message("m1").await.unwrap();

    assert_eq!(email.subject, "Plan");
    assert_eq!(
        clock.sleeps(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
    assert_eq!(session.provider().calls(Operation::GetMessage), 4);
    assert_eq!(session.stats().retried, 3);
}

#[tokio::test]
async fn test_permanent_error_surfaces() {
    let provider = mailbox();
    provider.fail_next(Operation::GetMessage, ProviderError::new(403, "forbidden"));
    let (session, clock) = session(provider);

    let error = session.fetch_message("m1").await.unwrap_err();

    assert!(matches!(
        error,
        Error::Scheduler(SchedulerError::Provider(ProviderError { status: 403, .. }))
    ));
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_list_messages_uses_default_page_size() {
    let (session, _) = session(mailbox());

    let page = session.list_messages("is:unread", 0, None).await.unwrap();
    assert_eq!(page.ids, ids(&["m1", "m2", "m3"]));
    assert!(page.next_page_token.is_none());

    let first = session.list_messages("", 2, None).await.unwrap();
    assert_eq!(first.ids.len(), 2);
    let rest = session
        .list_messages("", 2, first.next_page_token.as_deref())
        .await
        .unwrap();
    assert_eq!(rest.ids, ids(&["m3"]));
}

#[tokio::test]
async fn test_thread_ids_are_cached() {
    let (session, _) = session(mailbox());

    let thread = session.thread_message_ids("m2").await.unwrap();
    assert_eq!(thread, ids(&["m1", "m2"]));

    let again = session.thread_message_ids("m1").await.unwrap();
    assert_eq!(again, thread);
    assert_eq!(session.provider().calls(Operation::GetThreadMessageIds), 1);
}

#[tokio::test]
async fn test_mark_read_expands_to_thread() {
    let (session, _) = session(mailbox());

    session.mark_read(&ids(&["m1"])).await.unwrap();

    let provider = session.provider();
    assert!(!provider.labels("m1").unwrap().contains(&"UNREAD".to_string()));
    assert!(!provider.labels("m2").unwrap().contains(&"UNREAD".to_string()));
    assert!(provider.labels("m3").unwrap().contains(&"UNREAD".to_string()));

    session.mark_unread(&ids(&["m2"])).await.unwrap();
    assert!(provider.labels("m1").unwrap().contains(&"UNREAD".to_string()));
}

#[tokio::test]
async fn test_star_and_archive_stay_on_listed_messages() {
    let (session, _) = session(mailbox());

    session.set_starred(&ids(&["m1"]), true).await.unwrap();
    session.archive(&ids(&["m1"])).await.unwrap();

    let provider = session.provider();
    assert_eq!(provider.labels("m1").unwrap(), ids(&["UNREAD", "STARRED"]));
    assert_eq!(provider.labels("m2").unwrap(), ids(&["INBOX", "UNREAD"]));

    session.set_starred(&ids(&["m1"]), false).await.unwrap();
    assert_eq!(provider.labels("m1").unwrap(), ids(&["UNREAD"]));
}

#[tokio::test]
async fn test_send_rejects_bad_structure_before_any_call() {
    let (session, _) = session(mailbox());

    let no_recipients = ComposeRequest::new("Hi", "<p>hello</p>");
    let error = session.send(&no_recipients, None).await.unwrap_err();
    assert!(error.is_structure());

    let blank = ComposeRequest::new("Hi", "<p> </p>").to(Mailbox::new("", "bob@example.com"));
    let error = session.send(&blank, None).await.unwrap_err();
    assert!(error.is_structure());

    assert_eq!(session.provider().calls(Operation::SendRaw), 0);
}

#[tokio::test]
async fn test_send_reply_joins_thread() {
    let (session, _) = session(mailbox());
    assert_eq!(session.thread_message_ids("m1").await.unwrap().len(), 2);

    let reply = ComposeRequest::new("Re: Plan", "<p>Sounds good</p>")
        .to(Mailbox::new("Alice", "alice@example.com"))
        .in_reply_to("<m2@example.com>");
    let sent = session
        .send(&reply, Some("<m1@example.com>"))
        .await
        .unwrap();

    assert_eq!(sent.thread_id, "<m1@example.com>");
    assert_eq!(session.provider().sent().len(), 1);

    let thread = session.thread_message_ids("m1").await.unwrap();
    assert_eq!(thread, vec!["m1".to_string(), "m2".to_string(), sent.id.clone()]);

    let echoed = session.fetch_message(&sent.id).await.unwrap();
    assert_eq!(echoed.subject, "Re: Plan");
    assert_eq!(echoed.body, "<p>Sounds good</p>");
}

#[tokio::test]
async fn test_resolve_inline_images() {
    let html = format!(
        "<p>Chart</p><img src=\"data:image/png;base64,{}\">",
        encode_base64(PNG)
    );
    let composed =
        compose(&ComposeRequest::new("Chart", html).to(Mailbox::new("", "bob@example.com")))
            .unwrap();
    let provider = MemoryProvider::new();
    provider
        .insert_raw("img", composed.raw.as_bytes(), &["INBOX"])
        .unwrap();
    let (session, _) = session(provider);

    let mut email = session.fetch_message("img").await.unwrap();
    assert_eq!(email.inline_attachments.len(), 1);
    let cid = email.inline_attachments[0].content_id.clone();

    email.inline_attachments.push(InlineAttachment {
        content_id: "gone@example.com".to_string(),
        attachment_id: "att-missing".to_string(),
        mime_type: "image/png".to_string(),
        filename: None,
        size: 0,
    });
    let images = session.resolve_inline_images(&email).await;

    assert_eq!(images.len(), 1);
    assert_eq!(
        images[&cid],
        format!("data:image/png;base64,{}", encode_base64(PNG))
    );
}

#[tokio::test]
async fn test_fetch_attachment_bytes() {
    let provider = mailbox();
    provider.insert_attachment("m1", "a1", b"%PDF-1.4".to_vec());
    let (session, _) = session(provider);

    let bytes = session.fetch_attachment("m1", "a1").await.unwrap();
    assert_eq!(bytes, b"%PDF-1.4");

    let missing = session.fetch_attachment("m1", "a2").await.unwrap_err();
    assert_eq!(missing.provider_error().map(|e| e.status), Some(404));
}

#[tokio::test]
async fn test_switch_account_drops_thread_cache() {
    let (session, _) = session(mailbox());
    session.thread_message_ids("m1").await.unwrap();

    session.switch_account(mailbox());
    assert_eq!(session.provider().calls(Operation::GetThreadMessageIds), 0);

    session.thread_message_ids("m1").await.unwrap();
    let provider = session.provider();
    assert_eq!(provider.calls(Operation::GetMessage), 1);
    assert_eq!(provider.calls(Operation::GetThreadMessageIds), 1);
}

#[tokio::test(start_paused = true)]
async fn test_switch_account_mid_fetch_does_not_share_results() {
    let session = MailSession::new(mailbox().with_latency(Duration::from_millis(50)), config());

    let old_fetch = tokio::spawn({
        let session = session.clone();
        async move { session.fetch_message("m1").await }
    });
    while session.stats().in_flight < 1 {
        tokio::task::yield_now().await;
    }

    let other = MemoryProvider::new();
    other
        .insert_raw(
            "m1",
            raw("m1", "Other account", Some("<root@other.example>")).as_bytes(),
            &["INBOX"],
        )
        .unwrap();
    session.switch_account(other);

    let fresh = session.fetch_message("m1").await.unwrap();
    assert_eq!(fresh.subject, "Other account");
    assert_eq!(old_fetch.await.unwrap().unwrap().subject, "Plan");

    // The old account's result must not land in the new account's cache.
    let thread = session.thread_message_ids("m1").await.unwrap();
    assert_eq!(thread, ids(&["m1"]));
    let provider = session.provider();
    assert_eq!(provider.calls(Operation::GetMessage), 1);
    assert_eq!(provider.calls(Operation::GetThreadMessageIds), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_thread_lookups_share_one_call() {
    let session = MailSession::new(mailbox().with_latency(Duration::from_millis(50)), config());
    for result in session.fetch_messages(&ids(&["m1", "m2"])).await {
        result.unwrap();
    }

    let (a, b) = tokio::join!(
        session.thread_message_ids("m1"),
        session.thread_message_ids("m2")
    );

    assert_eq!(a.unwrap(), ids(&["m1", "m2"]));
    assert_eq!(b.unwrap(), ids(&["m1", "m2"]));
    assert_eq!(session.provider().calls(Operation::GetThreadMessageIds), 1);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_cancels_queued_fetches() {
    let config = SessionConfig::new().scheduler(
        SchedulerConfig::new()
            .max_concurrent(1)
            .min_dispatch_delay(Duration::ZERO),
    );
    let session = MailSession::new(mailbox().with_latency(Duration::from_millis(50)), config);

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.fetch_message("m1").await }
    });
    let queued = tokio::spawn({
        let session = session.clone();
        async move { session.fetch_message("m3").await }
    });
    while session.stats().pending < 1 || session.stats().in_flight < 1 {
        tokio::task::yield_now().await;
    }

    session.teardown();

    let cancelled = queued.await.unwrap().unwrap_err();
    assert!(matches!(cancelled, Error::Scheduler(SchedulerError::Cleared)));
    assert_eq!(running.await.unwrap().unwrap().subject, "Plan");
}
