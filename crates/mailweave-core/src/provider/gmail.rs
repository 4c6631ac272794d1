//! Gmail REST provider.

use std::future::Future;

use mailweave_mime::ProviderMessage;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{MailProvider, MessageList, ProviderError, ProviderResult, SentMessage};

/// Gmail v1 API root for the authenticated user.
pub const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Supplies bearer tokens.
///
/// Token acquisition and refresh live outside this crate; the provider
/// only asks for a currently valid token before each call.
pub trait TokenSource: Send + Sync + 'static {
    /// Returns a valid access token.
    fn token(&self) -> impl Future<Output = ProviderResult<String>> + Send;
}

/// A fixed access token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wraps an access token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

impl TokenSource for StaticToken {
    async fn token(&self) -> ProviderResult<String> {
        Ok(self.0.clone())
    }
}

/// [`MailProvider`] backed by the Gmail REST API.
#[derive(Debug)]
pub struct GmailProvider<T> {
    http: reqwest::Client,
    base_url: String,
    tokens: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<IdRef>,
    next_page_token: Option<String>,
    #[serde(default)]
    result_size_estimate: u64,
}

#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    raw: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest<'a> {
    ids: &'a [String],
    add_label_ids: &'a [String],
    remove_label_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    #[serde(default)]
    messages: Vec<IdRef>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl<T: TokenSource> GmailProvider<T> {
    /// Creates a provider for the default Gmail endpoint.
    #[must_use]
    pub fn new(tokens: T) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            tokens,
        }
    }

    /// Points the provider at another API root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder) -> ProviderResult<Response> {
        let token = self.tokens.token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|envelope| envelope.error.message)
            .unwrap_or_else(|_| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
        tracing::debug!(status = status.as_u16(), %message, "gmail request failed");
        Err(ProviderError::new(status.as_u16(), message))
    }

    async fn send_json<R: DeserializeOwned>(&self, request: RequestBuilder) -> ProviderResult<R> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        response
            .json::<R>()
            .await
            .map_err(|e| ProviderError::new(status, format!("invalid response body: {e}")))
    }
}

impl<T: TokenSource> MailProvider for GmailProvider<T> {
    async fn list_messages(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> ProviderResult<MessageList> {
        let mut params = vec![("maxResults", page_size.to_string())];
        if !query.is_empty() {
            params.push(("q", query.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let response: ListResponse = self
            .send_json(self.http.get(self.url("messages")).query(&params))
            .await?;

        Ok(MessageList {
            ids: response.messages.into_iter().map(|m| m.id).collect(),
            next_page_token: response.next_page_token,
            estimated_total: response.result_size_estimate,
        })
    }

    async fn get_message(&self, id: &str) -> ProviderResult<ProviderMessage> {
        let request = self
            .http
            .get(self.url(&format!("messages/{id}")))
            .query(&[("format", "full")]);
        self.send_json(request).await
    }

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> ProviderResult<String> {
        let request = self
            .http
            .get(self.url(&format!("messages/{message_id}/attachments/{attachment_id}")));
        let response: AttachmentResponse = self.send_json(request).await?;
        Ok(response.data)
    }

    async fn send_raw(&self, encoded: &str, thread_id: Option<&str>) -> ProviderResult<SentMessage> {
        let body = SendRequest {
            raw: encoded,
            thread_id,
        };
        let request = self.http.post(self.url("messages/send")).json(&body);
        self.send_json(request).await
    }

    async fn batch_modify_labels(
        &self,
        ids: &[String],
        add: &[String],
        remove: &[String],
    ) -> ProviderResult<()> {
        let body = ModifyRequest {
            ids,
            add_label_ids: add,
            remove_label_ids: remove,
        };
        let request = self.http.post(self.url("messages/batchModify")).json(&body);
        self.send(request).await.map(drop)
    }

    async fn get_thread_message_ids(&self, thread_id: &str) -> ProviderResult<Vec<String>> {
        let request = self
            .http
            .get(self.url(&format!("threads/{thread_id}")))
            .query(&[("format", "minimal")]);
        let response: ThreadResponse = self.send_json(request).await?;
        Ok(response.messages.into_iter().map(|m| m.id).collect())
    }
}
