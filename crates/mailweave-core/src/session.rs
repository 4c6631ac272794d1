//! Mail session.
//!
//! A [`MailSession`] owns everything that lives for one signed-in account:
//! the provider, the request scheduler, in-flight de-duplication and the
//! thread cache. It is cheap to clone and every clone shares the same
//! state, so it can be handed to background tasks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use mailweave_mime::encoding::{decode_base64url, encode_base64};
use mailweave_mime::{
    ComposeRequest, Composer, LABEL_INBOX, LABEL_STARRED, LABEL_UNREAD, ParsedEmail,
    ProviderMessage, parse_email,
};

use crate::config::SessionConfig;
use crate::dedup::InFlight;
use crate::error::{Error, Result};
use crate::provider::{MailProvider, MessageList, SentMessage};
use crate::scheduler::{RequestScheduler, SchedulerError, SchedulerStats};
use crate::thread_cache::ThreadMessageCache;
use crate::time::{Clock, TokioClock};

type Shared<T> = InFlight<std::result::Result<T, SchedulerError>>;

/// The signed-in account. `epoch` changes on every switch and is part of
/// every de-duplication key, so requests never join across accounts.
struct Account<P> {
    epoch: u64,
    provider: Arc<P>,
}

struct Inner<P> {
    account: RwLock<Account<P>>,
    scheduler: RequestScheduler,
    messages: Shared<ProviderMessage>,
    attachments: Shared<String>,
    thread_lists: Shared<Vec<String>>,
    threads: Mutex<ThreadMessageCache>,
    composer: Composer,
    config: SessionConfig,
}

/// Context for one account.
pub struct MailSession<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for MailSession<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> std::fmt::Debug for MailSession<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailSession")
            .field("config", &self.inner.config)
            .field("scheduler", &self.inner.scheduler)
            .finish_non_exhaustive()
    }
}

fn labels(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_string()).collect()
}

impl<P: MailProvider> MailSession<P> {
    /// Creates a session running on real time.
    #[must_use]
    pub fn new(provider: P, config: SessionConfig) -> Self {
        Self::with_clock(provider, config, Arc::new(TokioClock))
    }

    /// Creates a session whose scheduler uses the given clock.
    #[must_use]
    pub fn with_clock(provider: P, config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        let scheduler = RequestScheduler::new(config.scheduler.clone(), clock);
        let composer = Composer::new(config.compose_domain.clone());
        Self {
            inner: Arc::new(Inner {
                account: RwLock::new(Account {
                    epoch: 0,
                    provider: Arc::new(provider),
                }),
                scheduler,
                messages: InFlight::new(),
                attachments: InFlight::new(),
                thread_lists: InFlight::new(),
                threads: Mutex::new(ThreadMessageCache::new()),
                composer,
                config,
            }),
        }
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Returns the scheduler counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    /// Returns the current provider.
    #[must_use]
    pub fn provider(&self) -> Arc<P> {
        self.account().1
    }

    fn account(&self) -> (u64, Arc<P>) {
        let account = self
            .inner
            .account
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        (account.epoch, Arc::clone(&account.provider))
    }

    fn threads(&self) -> MutexGuard<'_, ThreadMessageCache> {
        self.inner
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `update` to the thread cache unless the account changed
    /// since `epoch`.
    fn update_threads(&self, epoch: u64, update: impl FnOnce(&mut ThreadMessageCache)) {
        let mut threads = self.threads();
        if self.account().0 == epoch {
            update(&mut threads);
        } else {
            tracing::debug!(epoch, "account switched, result not cached");
        }
    }

    /// Lists message ids matching a provider search query.
    ///
    /// A `page_size` of zero uses the configured default.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    #[tracing::instrument(skip(self))]
    pub async fn list_messages(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<MessageList> {
        let page_size = if page_size == 0 {
            self.inner.config.page_size
        } else {
            page_size
        };
        let provider = self.provider();
        let list = self
            .inner
            .scheduler
            .enqueue("list", || {
                let provider = Arc::clone(&provider);
                let query = query.to_string();
                let page_token = page_token.map(str::to_string);
                async move {
                    provider
                        .list_messages(&query, page_size, page_token.as_deref())
                        .await
                }
            })
            .await?;
        tracing::debug!(count = list.ids.len(), "listed messages");
        Ok(list)
    }

    async fn provider_message(&self, id: &str) -> Result<ProviderMessage> {
        let (epoch, provider) = self.account();
        let key = format!("message:{epoch}:{id}");
        let message = self
            .inner
            .messages
            .run(&key, || async {
                self.inner
                    .scheduler
                    .enqueue(&key, || {
                        let provider = Arc::clone(&provider);
                        let id = id.to_string();
                        async move { provider.get_message(&id).await }
                    })
                    .await
            })
            .await?;

        if let Some(thread_id) = &message.thread_id {
            self.update_threads(epoch, |threads| threads.record(&message.id, thread_id));
        }
        Ok(message)
    }

    /// Fetches and decodes one message.
    ///
    /// Concurrent fetches of the same id share one provider call.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails or the message payload
    /// is malformed.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_message(&self, id: &str) -> Result<ParsedEmail> {
        let message = self.provider_message(id).await?;
        Ok(parse_email(&message, &self.inner.config.decode)?)
    }

    /// Fetches and decodes several messages.
    ///
    /// The fetches run concurrently within the scheduler's limits. Results
    /// come back in the order of `ids`, one per id.
    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn fetch_messages(&self, ids: &[String]) -> Vec<Result<ParsedEmail>> {
        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let session = self.clone();
                let id = id.clone();
                tokio::spawn(async move { session.fetch_message(&id).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(error) => Err(Error::Task(error.to_string())),
            });
        }
        results
    }

    /// Fetches attachment bytes.
    ///
    /// Concurrent requests for the same attachment share one provider call.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails or the data is not
    /// valid Base64.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        let (epoch, provider) = self.account();
        let key = format!("attachment:{epoch}:{message_id}:{attachment_id}");
        let data = self
            .inner
            .attachments
            .run(&key, || async {
                self.inner
                    .scheduler
                    .enqueue(&key, || {
                        let provider = Arc::clone(&provider);
                        let message_id = message_id.to_string();
                        let attachment_id = attachment_id.to_string();
                        async move { provider.get_attachment(&message_id, &attachment_id).await }
                    })
                    .await
            })
            .await?;
        Ok(decode_base64url(&data)?)
    }

    /// Fetches the inline images of a message and returns them as data
    /// URLs keyed by Content-ID.
    ///
    /// Images that cannot be fetched are left out, so the renderer shows a
    /// broken image rather than failing the whole message.
    #[tracing::instrument(skip(self, email), fields(id = %email.id))]
    pub async fn resolve_inline_images(&self, email: &ParsedEmail) -> HashMap<String, String> {
        let handles: Vec<_> = email
            .inline_attachments
            .iter()
            .map(|inline| {
                let session = self.clone();
                let message_id = email.id.clone();
                let inline = inline.clone();
                tokio::spawn(async move {
                    let bytes = session
                        .fetch_attachment(&message_id, &inline.attachment_id)
                        .await;
                    (inline, bytes)
                })
            })
            .collect();

        let mut resolved = HashMap::new();
        for handle in handles {
            match handle.await {
                Ok((inline, Ok(bytes))) => {
                    let url = format!("data:{};base64,{}", inline.mime_type, encode_base64(&bytes));
                    resolved.insert(inline.content_id, url);
                }
                Ok((inline, Err(error))) => {
                    tracing::warn!(cid = %inline.content_id, %error, "inline image unavailable");
                }
                Err(error) => tracing::warn!(%error, "inline image task failed"),
            }
        }
        resolved
    }

    /// Returns the ids of every message in the thread of `message_id`.
    ///
    /// Thread listings are cached until the account changes, and concurrent
    /// misses for the same thread share one provider call. A message
    /// without a thread is its own thread.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails.
    #[tracing::instrument(skip(self))]
    pub async fn thread_message_ids(&self, message_id: &str) -> Result<Vec<String>> {
        let known = self.threads().thread_of(message_id).map(str::to_string);
        let thread_id = match known {
            Some(thread_id) => thread_id,
            None => match self.provider_message(message_id).await?.thread_id {
                Some(thread_id) => thread_id,
                None => return Ok(vec![message_id.to_string()]),
            },
        };

        let cached = self.threads().get(&thread_id).map(<[String]>::to_vec);
        if let Some(ids) = cached {
            return Ok(ids);
        }

        let (epoch, provider) = self.account();
        let key = format!("thread:{epoch}:{thread_id}");
        let ids = self
            .inner
            .thread_lists
            .run(&key, || async {
                self.inner
                    .scheduler
                    .enqueue(&key, || {
                        let provider = Arc::clone(&provider);
                        let thread_id = thread_id.clone();
                        async move { provider.get_thread_message_ids(&thread_id).await }
                    })
                    .await
            })
            .await?;
        self.update_threads(epoch, |threads| threads.insert(&thread_id, ids.clone()));
        Ok(ids)
    }

    /// Adds and removes labels.
    ///
    /// With `expand_threads` every message in the threads of `ids` is
    /// modified, not just the listed ones.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails.
    #[tracing::instrument(skip(self))]
    pub async fn modify_labels(
        &self,
        ids: &[String],
        add: &[String],
        remove: &[String],
        expand_threads: bool,
    ) -> Result<()> {
        let targets = if expand_threads {
            let mut seen = HashSet::new();
            let mut targets = Vec::new();
            for id in ids {
                for member in self.thread_message_ids(id).await? {
                    if seen.insert(member.clone()) {
                        targets.push(member);
                    }
                }
            }
            targets
        } else {
            ids.to_vec()
        };

        if targets.is_empty() {
            return Ok(());
        }

        let provider = self.provider();
        self.inner
            .scheduler
            .enqueue("labels", || {
                let provider = Arc::clone(&provider);
                let targets = targets.clone();
                let add = add.to_vec();
                let remove = remove.to_vec();
                async move { provider.batch_modify_labels(&targets, &add, &remove).await }
            })
            .await?;
        tracing::debug!(count = targets.len(), "labels modified");
        Ok(())
    }

    /// Marks messages and the rest of their threads as read.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails.
    pub async fn mark_read(&self, ids: &[String]) -> Result<()> {
        self.modify_labels(ids, &[], &labels(&[LABEL_UNREAD]), true)
            .await
    }

    /// Marks messages and the rest of their threads as unread.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails.
    pub async fn mark_unread(&self, ids: &[String]) -> Result<()> {
        self.modify_labels(ids, &labels(&[LABEL_UNREAD]), &[], true)
            .await
    }

    /// Stars or unstars messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn set_starred(&self, ids: &[String], starred: bool) -> Result<()> {
        let star = labels(&[LABEL_STARRED]);
        if starred {
            self.modify_labels(ids, &star, &[], false).await
        } else {
            self.modify_labels(ids, &[], &star, false).await
        }
    }

    /// Removes messages from the inbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn archive(&self, ids: &[String]) -> Result<()> {
        self.modify_labels(ids, &[], &labels(&[LABEL_INBOX]), false)
            .await
    }

    /// Composes and sends a message, optionally into an existing thread.
    ///
    /// # Errors
    ///
    /// Returns a structure error, before any provider call, when the
    /// request has no recipients or nothing to send. Otherwise returns an
    /// error if the provider rejects the message.
    #[tracing::instrument(skip(self, request), fields(subject = %request.subject))]
    pub async fn send(
        &self,
        request: &ComposeRequest,
        thread_id: Option<&str>,
    ) -> Result<SentMessage> {
        let composed = self.inner.composer.compose(request)?;
        let (epoch, provider) = self.account();
        let encoded = composed.encoded;

        let sent = self
            .inner
            .scheduler
            .enqueue("send", || {
                let provider = Arc::clone(&provider);
                let encoded = encoded.clone();
                let thread_id = thread_id.map(str::to_string);
                async move { provider.send_raw(&encoded, thread_id.as_deref()).await }
            })
            .await?;

        self.update_threads(epoch, |threads| {
            threads.forget(&sent.thread_id);
            threads.record(&sent.id, &sent.thread_id);
        });
        tracing::info!(
            id = %sent.id,
            thread_id = %sent.thread_id,
            message_id = %composed.message_id,
            "message sent"
        );
        Ok(sent)
    }

    /// Swaps in the provider for another account and drops the thread
    /// cache.
    ///
    /// Requests already queued keep the provider they were issued against,
    /// but new requests never join them and their results are not cached.
    /// Call [`teardown`](Self::teardown) first to cancel them.
    pub fn switch_account(&self, provider: P) {
        let epoch = {
            let mut account = self
                .inner
                .account
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            account.epoch += 1;
            account.provider = Arc::new(provider);
            account.epoch
        };
        self.threads().invalidate();
        tracing::info!(epoch, "switched account");
    }

    /// Cancels every request that has not started yet.
    pub fn teardown(&self) {
        self.inner.scheduler.clear();
        tracing::info!("session torn down");
    }
}
