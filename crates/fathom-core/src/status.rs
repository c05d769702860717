//! The 16-bit key-value status enumeration and the server-published
//! error map that reclassifies status codes into retryability
//! attributes.

use std::collections::{HashMap, HashSet};

/// A subset of the memcached-binary status space the orchestrator names
/// explicitly; anything else decodes to `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KvStatus {
    Success,
    NotFound,
    Exists,
    NotMyVbucket,
    AuthError,
    TemporaryFailure,
    UnknownCollection,
    Locked,
    SyncWriteInProgress,
    SyncWriteReCommitInProgress,
    SubdocPathError(u16),
    Other(u16),
}

impl From<u16> for KvStatus {
    fn from(code: u16) -> Self {
        match code {
            0x00 => KvStatus::Success,
            0x01 => KvStatus::NotFound,
            0x02 => KvStatus::Exists,
            0x07 => KvStatus::NotMyVbucket,
            0x20 => KvStatus::AuthError,
            0x86 => KvStatus::TemporaryFailure,
            0x88 => KvStatus::UnknownCollection,
            0x89 => KvStatus::Locked,
            0xa2 => KvStatus::SyncWriteInProgress,
            0xa3 => KvStatus::SyncWriteReCommitInProgress,
            0xc0..=0xd4 => KvStatus::SubdocPathError(code),
            other => KvStatus::Other(other),
        }
    }
}

impl From<KvStatus> for u16 {
    fn from(status: KvStatus) -> Self {
        match status {
            KvStatus::Success => 0x00,
            KvStatus::NotFound => 0x01,
            KvStatus::Exists => 0x02,
            KvStatus::NotMyVbucket => 0x07,
            KvStatus::AuthError => 0x20,
            KvStatus::TemporaryFailure => 0x86,
            KvStatus::UnknownCollection => 0x88,
            KvStatus::Locked => 0x89,
            KvStatus::SyncWriteInProgress => 0xa2,
            KvStatus::SyncWriteReCommitInProgress => 0xa3,
            KvStatus::SubdocPathError(code) | KvStatus::Other(code) => code,
        }
    }
}

impl KvStatus {
    pub fn is_success(self) -> bool {
        matches!(self, KvStatus::Success)
    }
}

/// The closed vocabulary of error-map attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorMapAttribute {
    RetryNow,
    RetryLater,
    Temp,
    Auth,
    ItemOnly,
    ConnStateInvalidated,
    Other,
}

impl ErrorMapAttribute {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "retry-now" => ErrorMapAttribute::RetryNow,
            "retry-later" => ErrorMapAttribute::RetryLater,
            "temp" => ErrorMapAttribute::Temp,
            "auth" => ErrorMapAttribute::Auth,
            "item-only" => ErrorMapAttribute::ItemOnly,
            "conn-state-invalidated" => ErrorMapAttribute::ConnStateInvalidated,
            _ => ErrorMapAttribute::Other,
        }
    }
}

/// One entry of the server's error map: a status code's symbolic name
/// and its retry-relevant attributes.
#[derive(Clone, Debug, Default)]
pub struct ErrorMapEntry {
    pub name: String,
    pub description: String,
    pub attributes: HashSet<ErrorMapAttribute>,
}

impl ErrorMapEntry {
    pub fn has(&self, attribute: ErrorMapAttribute) -> bool {
        self.attributes.contains(&attribute)
    }
}

/// The full map, fetched once per session at handshake time.
#[derive(Clone, Debug, Default)]
pub struct ErrorMap {
    entries: HashMap<u16, ErrorMapEntry>,
}

impl ErrorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: u16, entry: ErrorMapEntry) {
        self.entries.insert(code, entry);
    }

    pub fn lookup(&self, code: u16) -> Option<&ErrorMapEntry> {
        self.entries.get(&code)
    }

    /// Does this status reclassify to `kv_error_map_retry_indicated`?
    pub fn indicates_retry(&self, code: u16) -> bool {
        self.lookup(code)
            .map(|entry| entry.has(ErrorMapAttribute::RetryNow) || entry.has(ErrorMapAttribute::RetryLater))
            .unwrap_or(false)
    }

    pub fn invalidates_connection(&self, code: u16) -> bool {
        self.lookup(code)
            .map(|entry| entry.has(ErrorMapAttribute::ConnStateInvalidated))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        for code in [0x00u16, 0x01, 0x02, 0x07, 0x20, 0x86, 0x88, 0x89, 0xa2, 0xa3] {
            let status = KvStatus::from(code);
            assert_eq!(u16::from(status), code);
        }
    }

    #[test]
    fn subdoc_range_classifies_as_path_error() {
        assert!(matches!(KvStatus::from(0xc5), KvStatus::SubdocPathError(0xc5)));
    }

    #[test]
    fn error_map_retry_indication_requires_attribute() {
        let mut map = ErrorMap::new();
        map.insert(
            0x99,
            ErrorMapEntry {
                name: "SYNTHETIC".into(),
                description: "test-only".into(),
                attributes: HashSet::from([ErrorMapAttribute::RetryLater]),
            },
        );
        assert!(map.indicates_retry(0x99));
        assert!(!map.indicates_retry(0x9a));
    }
}
