//! The error taxonomy: a structured error code, scoped to one
//! of the service families, plus the per-operation context a caller can
//! inspect to understand *why* and *where* a request failed.

use std::time::Duration;
use thiserror::Error;

use crate::ids::Opaque;
use crate::retry::RetryReason;

/// Which service family an error code belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Common,
    KeyValue,
    Query,
    Analytics,
    Search,
    View,
    Management,
}

/// Errors shared across every service family: deadline/cancellation,
/// topology, and auth.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommonError {
    #[error("operation timed out with result unknown (may have applied)")]
    AmbiguousTimeout,
    #[error("operation timed out; safe to retry")]
    UnambiguousTimeout,
    #[error("request canceled")]
    RequestCanceled,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("no service session available for this request")]
    ServiceNotAvailable,
    #[error("node not available")]
    NodeNotAvailable,
    #[error("authentication failure")]
    AuthenticationFailure,
    #[error("feature not negotiated with this server")]
    FeatureNotAvailable,
    #[error("circuit breaker open")]
    CircuitBreakerOpen,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Key-value specific errors, one per named wire status code.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum KeyValueError {
    #[error("document not found")]
    DocumentNotFound,
    #[error("document already exists / CAS mismatch")]
    DocumentExists,
    #[error("document is locked")]
    DocumentLocked,
    #[error("temporary failure, try again")]
    TemporaryFailure,
    #[error("synchronous write in progress")]
    SyncWriteInProgress,
    #[error("synchronous write re-commit in progress")]
    SyncWriteReCommitInProgress,
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    #[error("not my vbucket")]
    NotMyVbucket,
    #[error("subdocument path error: {0}")]
    PathError(String),
    #[error("durability level invalid or not satisfiable")]
    DurabilityInvalid,
    #[error("value too large")]
    ValueTooLarge,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("prepared statement failure")]
    PreparedStatementFailure,
    #[error("index not found")]
    IndexNotFound,
    #[error("planning failure: {0}")]
    PlanningFailure(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AnalyticsError {
    #[error("temporary failure, try again")]
    TemporaryFailure,
    #[error("job queue full")]
    JobQueueFull,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("too many requests")]
    TooManyRequests,
    #[error("index not found")]
    IndexNotFound,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ViewError {
    #[error("temporary failure, try again")]
    TemporaryFailure,
    #[error("no active partition")]
    NoActivePartition,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ManagementError {
    #[error("resource already exists")]
    AlreadyExists,
    #[error("resource not found")]
    NotFound,
}

/// The structured error code: a category plus its specific variant.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error(transparent)]
    Common(#[from] CommonError),
    #[error(transparent)]
    KeyValue(#[from] KeyValueError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Analytics(#[from] AnalyticsError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    View(#[from] ViewError),
    #[error(transparent)]
    Management(#[from] ManagementError),
}

impl ClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::Common(_) => ErrorCategory::Common,
            ClientError::KeyValue(_) => ErrorCategory::KeyValue,
            ClientError::Query(_) => ErrorCategory::Query,
            ClientError::Analytics(_) => ErrorCategory::Analytics,
            ClientError::Search(_) => ErrorCategory::Search,
            ClientError::View(_) => ErrorCategory::View,
            ClientError::Management(_) => ErrorCategory::Management,
        }
    }
}

/// Per-operation diagnostic context: everything a caller needs
/// to understand why a request failed and what was retried along the
/// way.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub opaque: Option<Opaque>,
    pub last_dispatched_to: Option<String>,
    pub last_dispatched_from: Option<String>,
    pub status_code: Option<u16>,
    pub error_map_info: Option<String>,
    pub server_duration: Option<Duration>,
    pub retry_attempts: u32,
    pub retry_reasons: Vec<RetryReason>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_retry(&mut self, reason: RetryReason) {
        self.retry_attempts += 1;
        self.retry_reasons.push(reason);
    }
}

/// A failed operation as seen by the caller: the structured code plus
/// the context that explains it.
#[derive(Clone, Debug, Error)]
#[error("{error}")]
pub struct OperationError {
    pub error: ClientError,
    pub context: RequestContext,
}

impl OperationError {
    pub fn new(error: impl Into<ClientError>, context: RequestContext) -> Self {
        Self {
            error: error.into(),
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_matches_variant() {
        let err: ClientError = KeyValueError::NotMyVbucket.into();
        assert_eq!(err.category(), ErrorCategory::KeyValue);
    }

    #[test]
    fn request_context_accumulates_retries() {
        let mut ctx = RequestContext::new();
        ctx.record_retry(RetryReason::KvNotMyVbucket);
        ctx.record_retry(RetryReason::KvTemporaryFailure);
        assert_eq!(ctx.retry_attempts, 2);
        assert_eq!(ctx.retry_reasons.len(), 2);
    }
}
