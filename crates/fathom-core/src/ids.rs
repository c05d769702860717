//! Identifiers that flow through the dispatch core: the per-session
//! opaque tag used to match a response to its request, and the document
//! identifier a key-value operation addresses.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// A 32-bit client-assigned request tag, echoed back by the server and
/// used as the sole dispatch key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opaque(pub u32);

impl fmt::Display for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Generates unique opaque values for one session.
///
/// The counter wraps at `u32::MAX`. Wraparound cannot alias a live entry
/// because the caller is expected to bound the in-flight table to a
/// ceiling far below 2^32; `OpaqueAllocator` itself
/// does not enforce that ceiling — the session's opaque table does, by
/// refusing to admit more than `max_in_flight` entries.
#[derive(Debug, Default)]
pub struct OpaqueAllocator {
    next: AtomicU32,
}

impl OpaqueAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Returns the next opaque, skipping `0` (reserved: some servers use
    /// opaque `0` on unsolicited frames that aren't truly a response to
    /// any request).
    pub fn next(&self) -> Opaque {
        loop {
            let value = self.next.fetch_add(1, Ordering::Relaxed);
            if value != 0 {
                return Opaque(value);
            }
        }
    }
}

/// A collection reference: either the string path the caller wrote, or
/// the numeric id the server resolved it to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CollectionRef {
    Unresolved(String),
    Resolved(u32),
}

impl CollectionRef {
    pub fn default_collection() -> Self {
        CollectionRef::Resolved(0)
    }

    pub fn as_path(&self) -> Option<&str> {
        match self {
            CollectionRef::Unresolved(path) => Some(path.as_str()),
            CollectionRef::Resolved(_) => None,
        }
    }

    pub fn resolved_id(&self) -> Option<u32> {
        match self {
            CollectionRef::Resolved(id) => Some(*id),
            CollectionRef::Unresolved(_) => None,
        }
    }
}

/// The tuple `(bucket, scope, collection, key)` that addresses one
/// document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentId {
    pub bucket: String,
    pub scope: String,
    pub collection: CollectionRef,
    pub key: Vec<u8>,
}

impl DocumentId {
    pub fn new(bucket: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket: bucket.into(),
            scope: "_default".to_string(),
            collection: CollectionRef::default_collection(),
            key: key.into(),
        }
    }

    pub fn with_collection(mut self, scope: impl Into<String>, collection: impl Into<String>) -> Self {
        self.scope = scope.into();
        self.collection = CollectionRef::Unresolved(collection.into());
        self
    }

    /// `"scope.collection"`, the cache key collection resolution is keyed
    /// on.
    pub fn collection_path(&self) -> Option<String> {
        self.collection
            .as_path()
            .map(|path| format!("{}.{}", self.scope, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_never_hands_out_zero() {
        let allocator = OpaqueAllocator::new();
        for _ in 0..4 {
            assert_ne!(allocator.next().0, 0);
        }
    }

    #[test]
    fn allocator_is_monotonic_until_wraparound() {
        let allocator = OpaqueAllocator::new();
        let first = allocator.next();
        let second = allocator.next();
        assert!(second.0 > first.0);
    }

    #[test]
    fn collection_path_is_none_for_resolved_ids() {
        let id = DocumentId::new("b", b"k".to_vec());
        assert_eq!(id.collection_path(), None);
    }

    #[test]
    fn collection_path_joins_scope_and_collection() {
        let id = DocumentId::new("b", b"k".to_vec()).with_collection("s", "c");
        assert_eq!(id.collection_path().as_deref(), Some("s.c"));
    }
}
