//! In-memory provider for tests and offline use.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mailweave_mime::encoding::{decode_base64url, encode_base64url};
use mailweave_mime::{ProviderMessage, parse_raw};

use super::{MailProvider, MessageList, ProviderError, ProviderResult, SentMessage};

/// A provider operation, for scripting failures and counting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`MailProvider::list_messages`].
    ListMessages,
    /// [`MailProvider::get_message`].
    GetMessage,
    /// [`MailProvider::get_attachment`].
    GetAttachment,
    /// [`MailProvider::send_raw`].
    SendRaw,
    /// [`MailProvider::batch_modify_labels`].
    BatchModifyLabels,
    /// [`MailProvider::get_thread_message_ids`].
    GetThreadMessageIds,
}

#[derive(Debug, Default)]
struct State {
    messages: Vec<ProviderMessage>,
    attachments: HashMap<(String, String), Vec<u8>>,
    failures: HashMap<Operation, VecDeque<ProviderError>>,
    calls: HashMap<Operation, usize>,
    sent: Vec<String>,
}

/// A mailbox held in memory.
///
/// Failures can be scripted per operation and every call is counted, which
/// makes it the test double for the scheduler and session.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemoryProvider {
    /// Creates an empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency` (Tokio time).
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a message, replacing one with the same id.
    pub fn insert_message(&self, message: ProviderMessage) {
        let mut state = self.state();
        state.messages.retain(|m| m.id != message.id);
        state.messages.push(message);
    }

    /// Parses a raw RFC 5322 message and adds it with the given labels.
    ///
    /// Attachment bytes become fetchable under the parser's synthetic ids.
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed input.
    pub fn insert_raw(
        &self,
        id: &str,
        raw: &[u8],
        labels: &[&str],
    ) -> mailweave_mime::Result<ProviderMessage> {
        let parsed = parse_raw(raw)?;
        let mut message = parsed.to_provider_message(id);
        message.label_ids = labels.iter().map(|l| (*l).to_string()).collect();

        {
            let mut state = self.state();
            for (attachment_id, bytes) in parsed.attachments {
                state
                    .attachments
                    .insert((id.to_string(), attachment_id), bytes);
            }
        }
        self.insert_message(message.clone());
        Ok(message)
    }

    /// Stores attachment bytes.
    pub fn insert_attachment(&self, message_id: &str, attachment_id: &str, bytes: Vec<u8>) {
        self.state().attachments.insert(
            (message_id.to_string(), attachment_id.to_string()),
            bytes,
        );
    }

    /// Makes the next call of `operation` fail with `error`.
    ///
    /// Scripted failures queue up and are consumed in order.
    pub fn fail_next(&self, operation: Operation, error: ProviderError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Number of calls made to `operation`, failed ones included.
    #[must_use]
    pub fn calls(&self, operation: Operation) -> usize {
        self.state().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Raw text of every message sent.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    /// Labels currently on a message.
    #[must_use]
    pub fn labels(&self, id: &str) -> Option<Vec<String>> {
        self.state()
            .messages
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.label_ids.clone())
    }

    async fn begin(&self, operation: Operation) -> ProviderResult<()> {
        let failure = {
            let mut state = self.state();
            *state.calls.entry(operation).or_default() += 1;
            state
                .failures
                .get_mut(&operation)
                .and_then(VecDeque::pop_front)
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        failure.map_or(Ok(()), Err)
    }
}

fn not_found(what: &str, id: &str) -> ProviderError {
    ProviderError::new(404, format!("{what} {id} not found"))
}

fn matches_query(message: &ProviderMessage, query: &str) -> bool {
    query.split_whitespace().all(|term| {
        if let Some(label) = term.strip_prefix("label:") {
            return message
                .label_ids
                .iter()
                .any(|l| l.eq_ignore_ascii_case(label));
        }
        if term.eq_ignore_ascii_case("is:unread") {
            return message.has_label("UNREAD");
        }
        let term = term.to_lowercase();
        let subject = message
            .payload
            .as_ref()
            .and_then(|p| p.header("subject"))
            .unwrap_or_default()
            .to_lowercase();
        let snippet = message.snippet.as_deref().unwrap_or_default().to_lowercase();
        subject.contains(&term) || snippet.contains(&term)
    })
}

impl MailProvider for MemoryProvider {
    async fn list_messages(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> ProviderResult<MessageList> {
        self.begin(Operation::ListMessages).await?;

        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ProviderError::new(400, format!("invalid page token {token}")))?,
            None => 0,
        };
        let page_size = usize::try_from(page_size).unwrap_or(usize::MAX).max(1);

        let state = self.state();
        let matching: Vec<&ProviderMessage> = state
            .messages
            .iter()
            .filter(|m| matches_query(m, query))
            .collect();
        let end = offset.saturating_add(page_size).min(matching.len());

        Ok(MessageList {
            ids: matching
                .get(offset..end)
                .unwrap_or_default()
                .iter()
                .map(|m| m.id.clone())
                .collect(),
            next_page_token: (end < matching.len()).then(|| end.to_string()),
            estimated_total: matching.len() as u64,
        })
    }

    async fn get_message(&self, id: &str) -> ProviderResult<ProviderMessage> {
        self.begin(Operation::GetMessage).await?;
        self.state()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| not_found("message", id))
    }

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> ProviderResult<String> {
        self.begin(Operation::GetAttachment).await?;
        self.state()
            .attachments
            .get(&(message_id.to_string(), attachment_id.to_string()))
            .map(|bytes| encode_base64url(bytes))
            .ok_or_else(|| not_found("attachment", attachment_id))
    }

    async fn send_raw(&self, encoded: &str, thread_id: Option<&str>) -> ProviderResult<SentMessage> {
        self.begin(Operation::SendRaw).await?;

        let raw = decode_base64url(encoded)
            .map_err(|e| ProviderError::new(400, format!("invalid raw message: {e}")))?;
        let parsed = parse_raw(&raw)
            .map_err(|e| ProviderError::new(400, format!("invalid raw message: {e}")))?;

        let mut state = self.state();
        let number = state.sent.len() + 1;
        let id = format!("sent-{number}");
        let thread_id = thread_id.map_or_else(|| format!("thread-sent-{number}"), str::to_string);

        let mut message = parsed.to_provider_message(id.clone());
        message.thread_id = Some(thread_id.clone());
        message.label_ids = vec!["SENT".to_string()];
        for (attachment_id, bytes) in parsed.attachments {
            state.attachments.insert((id.clone(), attachment_id), bytes);
        }
        state.messages.push(message);
        state.sent.push(String::from_utf8_lossy(&raw).into_owned());

        Ok(SentMessage { id, thread_id })
    }

    async fn batch_modify_labels(
        &self,
        ids: &[String],
        add: &[String],
        remove: &[String],
    ) -> ProviderResult<()> {
        self.begin(Operation::BatchModifyLabels).await?;

        let mut state = self.state();
        if let Some(missing) = ids
            .iter()
            .find(|id| !state.messages.iter().any(|m| &m.id == *id))
        {
            return Err(not_found("message", missing));
        }
        for message in state.messages.iter_mut().filter(|m| ids.contains(&m.id)) {
            message.label_ids.retain(|label| !remove.contains(label));
            for label in add {
                if !message.label_ids.contains(label) {
                    message.label_ids.push(label.clone());
                }
            }
        }
        Ok(())
    }

    async fn get_thread_message_ids(&self, thread_id: &str) -> ProviderResult<Vec<String>> {
        self.begin(Operation::GetThreadMessageIds).await?;
        let ids: Vec<String> = self
            .state()
            .messages
            .iter()
            .filter(|m| m.thread_id.as_deref() == Some(thread_id))
            .map(|m| m.id.clone())
            .collect();
        if ids.is_empty() {
            return Err(not_found("thread", thread_id));
        }
        Ok(ids)
    }
}
