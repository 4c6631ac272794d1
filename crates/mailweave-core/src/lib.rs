//! # mailweave-core
//!
//! Fetch pipeline for provider-backed web mail.
//!
//! This crate provides:
//! - A provider interface with a Gmail REST implementation and an
//!   in-memory one for tests
//! - A rate-limited FIFO request scheduler with exponential backoff
//! - In-flight request de-duplication
//! - A thread membership cache
//! - [`MailSession`], the per-account context tying them together
//!
//! Decoding and composing messages lives in `mailweave-mime`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod config;
pub mod dedup;
mod error;
pub mod provider;
pub mod scheduler;
mod session;
pub mod thread_cache;
pub mod time;

pub use config::SessionConfig;
pub use dedup::InFlight;
pub use error::{Error, Result};
pub use provider::{
    GmailProvider, MailProvider, MemoryProvider, MessageList, Operation, ProviderError,
    ProviderResult, SentMessage, StaticToken, TokenSource,
};
pub use scheduler::{RequestScheduler, SchedulerConfig, SchedulerError, SchedulerStats, TaskState};
pub use session::MailSession;
pub use thread_cache::ThreadMessageCache;
pub use time::{Clock, ManualClock, TokioClock};
