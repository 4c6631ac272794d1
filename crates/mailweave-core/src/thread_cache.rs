//! Thread membership cache.

use std::collections::HashMap;

/// Maps thread ids to their message ids, and message ids back to threads.
///
/// Owned by a session. Account switches invalidate it wholesale.
#[derive(Debug, Default, Clone)]
pub struct ThreadMessageCache {
    threads: HashMap<String, Vec<String>>,
    message_threads: HashMap<String, String>,
}

impl ThreadMessageCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached message ids of a thread.
    #[must_use]
    pub fn get(&self, thread_id: &str) -> Option<&[String]> {
        self.threads.get(thread_id).map(Vec::as_slice)
    }

    /// Stores the full message list of a thread.
    pub fn insert(&mut self, thread_id: &str, message_ids: Vec<String>) {
        for id in &message_ids {
            self.message_threads
                .insert(id.clone(), thread_id.to_string());
        }
        self.threads.insert(thread_id.to_string(), message_ids);
    }

    /// Remembers which thread a message belongs to without listing the
    /// thread.
    pub fn record(&mut self, message_id: &str, thread_id: &str) {
        self.message_threads
            .insert(message_id.to_string(), thread_id.to_string());
    }

    /// Returns the thread a message belongs to, if known.
    #[must_use]
    pub fn thread_of(&self, message_id: &str) -> Option<&str> {
        self.message_threads.get(message_id).map(String::as_str)
    }

    /// Drops the message list of one thread, keeping the reverse mapping.
    pub fn forget(&mut self, thread_id: &str) {
        self.threads.remove(thread_id);
    }

    /// Drops everything.
    pub fn invalidate(&mut self) {
        self.threads.clear();
        self.message_threads.clear();
    }

    /// Number of cached threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Returns `true` if no thread is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut cache = ThreadMessageCache::new();
        cache.insert("t1", ids(&["m1", "m2"]));

        assert_eq!(cache.get("t1"), Some(ids(&["m1", "m2"]).as_slice()));
        assert_eq!(cache.thread_of("m2"), Some("t1"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("t2").is_none());
    }

    #[test]
    fn test_record_without_listing() {
        let mut cache = ThreadMessageCache::new();
        cache.record("m9", "t9");

        assert_eq!(cache.thread_of("m9"), Some("t9"));
        assert!(cache.get("t9").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_forget_keeps_membership() {
        let mut cache = ThreadMessageCache::new();
        cache.insert("t1", ids(&["m1", "m2"]));
        cache.forget("t1");

        assert!(cache.get("t1").is_none());
        assert_eq!(cache.thread_of("m1"), Some("t1"));
    }

    #[test]
    fn test_invalidate() {
        let mut cache = ThreadMessageCache::new();
        cache.insert("t1", ids(&["m1"]));
        cache.invalidate();

        assert!(cache.is_empty());
        assert!(cache.thread_of("m1").is_none());
    }
}
