//! In-flight request de-duplication.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;

/// Shares one execution between concurrent callers asking for the same key.
///
/// The first caller for a key runs its future; callers arriving while it is
/// still running wait for that result and get a clone of it. Once the shared
/// execution completes the key is released, so a later call runs again.
#[derive(Debug)]
pub struct InFlight<T> {
    calls: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> InFlight<T> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<String, Arc<OnceCell<T>>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `make()` under `key`, or joins the execution already running
    /// under it.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = Arc::clone(self.calls().entry(key.to_string()).or_default());

        let mut joined = true;
        let value = cell
            .get_or_init(|| {
                joined = false;
                make()
            })
            .await
            .clone();

        if joined {
            tracing::debug!(key, "joined in-flight request");
        }

        // A newer cell may already sit under the key if this one finished
        // and was released by another caller.
        let mut calls = self.calls();
        if calls.get(key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            calls.remove(key);
        }
        value
    }

    /// Number of keys with an execution in progress.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls().len()
    }

    /// Returns `true` if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls().is_empty()
    }
}
