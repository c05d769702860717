//! The collection-id resolution cache. Lives on the session rather than
//! the bucket: a resolved id is scoped to this session's negotiated
//! collections feature, so invalidating a session invalidates its cache
//! for free.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const UNKNOWN_COLLECTION_BACKOFF: Duration = Duration::from_millis(500);

/// `collection_path -> numeric_id`, plus a per-path cooldown after the
/// server calls a path unknown, so a hot retry loop doesn't re-resolve
/// the same path on every attempt.
#[derive(Default)]
pub struct CollectionCache {
    resolved: Mutex<HashMap<String, u32>>,
    unknown_until: Mutex<HashMap<String, Instant>>,
}

impl CollectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<u32> {
        self.resolved.lock().expect("poisoned").get(path).copied()
    }

    pub fn insert(&self, path: String, id: u32) {
        self.resolved.lock().expect("poisoned").insert(path.clone(), id);
        self.unknown_until.lock().expect("poisoned").remove(&path);
    }

    /// The server reported `path` as unknown, on either the resolution
    /// call or a request that used a since-stale cached id: drop it and
    /// start the backoff window.
    pub fn invalidate(&self, path: &str) {
        self.resolved.lock().expect("poisoned").remove(path);
        self.unknown_until
            .lock()
            .expect("poisoned")
            .insert(path.to_string(), Instant::now() + UNKNOWN_COLLECTION_BACKOFF);
    }

    /// `false` while `path` is still inside its post-unknown backoff
    /// window.
    pub fn ready_to_resolve(&self, path: &str) -> bool {
        match self.unknown_until.lock().expect("poisoned").get(path) {
            Some(until) => Instant::now() >= *until,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_insert_then_hit() {
        let cache = CollectionCache::new();
        assert_eq!(cache.get("s.c"), None);
        cache.insert("s.c".to_string(), 9);
        assert_eq!(cache.get("s.c"), Some(9));
    }

    #[test]
    fn invalidate_clears_the_id_and_starts_a_backoff() {
        let cache = CollectionCache::new();
        cache.insert("s.c".to_string(), 9);
        cache.invalidate("s.c");
        assert_eq!(cache.get("s.c"), None);
        assert!(!cache.ready_to_resolve("s.c"));
    }

    #[test]
    fn paths_never_invalidated_are_always_ready() {
        let cache = CollectionCache::new();
        assert!(cache.ready_to_resolve("s.never-seen"));
    }
}
