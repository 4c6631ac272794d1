//! Mail provider interface.
//!
//! Everything the session needs from a mail API: listing, fetching
//! messages and attachments, sending, and batch label changes. A valid
//! credential is assumed; failures come back as [`ProviderError`] carrying
//! the HTTP status.

mod gmail;
mod memory;

use std::future::Future;

use mailweave_mime::ProviderMessage;
use serde::{Deserialize, Serialize};

pub use gmail::{GmailProvider, StaticToken, TokenSource};
pub use memory::{MemoryProvider, Operation};

/// Status used for failures that never reached the server.
pub const STATUS_TRANSPORT: u16 = 0;

/// Status the provider uses to signal rate limiting.
pub const STATUS_RATE_LIMITED: u16 = 429;

/// A failed provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provider error {status}: {message}")]
pub struct ProviderError {
    /// HTTP status, or [`STATUS_TRANSPORT`] for network failures.
    pub status: u16,
    /// Error message from the provider or transport.
    pub message: String,
}

impl ProviderError {
    /// Creates a provider error.
    #[must_use]
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(STATUS_TRANSPORT, message)
    }

    /// Returns `true` for a rate-limit response.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        self.status == STATUS_RATE_LIMITED
    }

    /// Returns `true` for server errors and transport failures.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.status == STATUS_TRANSPORT || self.status >= 500
    }

    /// Returns `true` for client errors other than rate limiting.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.status >= 400 && self.status < 500 && !self.is_rate_limited()
    }
}

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// One page of message ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageList {
    /// Message ids on this page.
    pub ids: Vec<String>,
    /// Token for the next page.
    pub next_page_token: Option<String>,
    /// The provider's estimate of the total result count.
    pub estimated_total: u64,
}

/// Ids assigned to a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    /// Message id.
    pub id: String,
    /// Thread id.
    pub thread_id: String,
}

/// A mail API.
///
/// Implementations are shared between concurrent tasks, so every method
/// takes `&self` and returns a `Send` future.
pub trait MailProvider: Send + Sync + 'static {
    /// Lists message ids matching a search query.
    fn list_messages(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> impl Future<Output = ProviderResult<MessageList>> + Send;

    /// Fetches a full message with its part tree.
    fn get_message(&self, id: &str) -> impl Future<Output = ProviderResult<ProviderMessage>> + Send;

    /// Fetches attachment bytes as URL-safe Base64.
    fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> impl Future<Output = ProviderResult<String>> + Send;

    /// Sends a message given as unpadded URL-safe Base64 of its raw form.
    fn send_raw(
        &self,
        encoded: &str,
        thread_id: Option<&str>,
    ) -> impl Future<Output = ProviderResult<SentMessage>> + Send;

    /// Adds and removes labels on a set of messages.
    fn batch_modify_labels(
        &self,
        ids: &[String],
        add: &[String],
        remove: &[String],
    ) -> impl Future<Output = ProviderResult<()>> + Send;

    /// Lists the ids of every message in a thread.
    fn get_thread_message_ids(
        &self,
        thread_id: &str,
    ) -> impl Future<Output = ProviderResult<Vec<String>>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let rate_limited = ProviderError::new(429, "slow down");
        assert!(rate_limited.is_rate_limited());
        assert!(!rate_limited.is_transient());
        assert!(!rate_limited.is_permanent());

        let server = ProviderError::new(503, "unavailable");
        assert!(server.is_transient());
        assert!(!server.is_permanent());

        let not_found = ProviderError::new(404, "not found");
        assert!(not_found.is_permanent());
        assert!(!not_found.is_transient());

        let transport = ProviderError::transport("connection reset");
        assert_eq!(transport.status, STATUS_TRANSPORT);
        assert!(transport.is_transient());
    }

    #[test]
    fn test_error_display() {
        let error = ProviderError::new(403, "forbidden");
        assert_eq!(error.to_string(), "provider error 403: forbidden");
    }
}
