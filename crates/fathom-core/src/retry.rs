//! The retry orchestrator's decision table (C7): given why an attempt
//! failed and whether the request is idempotent, decide whether
//! to retry (possibly after remapping to a new node) or surface the
//! failure to the caller. Backoff scheduling is kept separate from the
//! decision itself so the two can be unit-tested independently.

use std::time::Duration;

/// Why a single attempt failed, reclassified from the raw wire status
/// into the vocabulary the orchestrator reasons about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryReason {
    KvNotMyVbucket,
    KvCollectionOutdated,
    ViewsNoActivePartition,
    ServiceNotAvailable,
    NodeNotAvailable,
    SocketNotAvailable,
    KvErrorMapRetryIndicated,
    KvLocked,
    KvTemporaryFailure,
    KvSyncWriteInProgress,
    KvSyncWriteReCommitInProgress,
    ServiceResponseCodeIndicated,
    CircuitBreakerOpen,
    QueryPreparedStatementFailure,
    QueryIndexNotFound,
    AnalyticsTemporaryFailure,
    SearchTooManyRequests,
    ViewsTemporaryFailure,
    SocketClosedWhileInFlight,
    Unknown,
    DoNotRetry,
}

impl RetryReason {
    /// Reasons that always retry (after remapping to a fresh
    /// configuration), regardless of idempotency.
    fn always_retries(self) -> bool {
        matches!(
            self,
            RetryReason::KvNotMyVbucket
                | RetryReason::KvCollectionOutdated
                | RetryReason::ViewsNoActivePartition
        )
    }

    /// Reasons that surface unconditionally, never retried.
    fn never_retries(self) -> bool {
        matches!(
            self,
            RetryReason::SocketClosedWhileInFlight | RetryReason::Unknown | RetryReason::DoNotRetry
        )
    }
}

/// The orchestrator's verdict for one failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Surface,
}

/// `decide(reason, idempotent)` — the retry decision table as a pure function.
///
/// Every reason not in the always-retry or never-retry sets retries only
/// if the request is idempotent; otherwise it surfaces.
pub fn decide(reason: RetryReason, idempotent: bool) -> RetryDecision {
    if reason.always_retries() {
        return RetryDecision::Retry;
    }
    if reason.never_retries() {
        return RetryDecision::Surface;
    }
    if idempotent {
        RetryDecision::Retry
    } else {
        RetryDecision::Surface
    }
}

/// The read-only opcode set that makes a request idempotent even when
/// the caller didn't flag it explicitly.
pub fn opcode_is_idempotent(opcode: &str) -> bool {
    matches!(opcode, "get" | "lookup_in" | "observe" | "get_replica" | "stat" | "noop")
}

/// Exponential backoff, base 1 ms, factor 2, capped at 500 ms.
/// `attempt` is 0-based: the first retry uses `attempt == 0`.
pub fn backoff_for(attempt: u32) -> Duration {
    const BASE: Duration = Duration::from_millis(1);
    const CAP: Duration = Duration::from_millis(500);
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let millis = (BASE.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prop_assert;

    #[test]
    fn always_retry_reasons_retry_even_when_not_idempotent() {
        for reason in [
            RetryReason::KvNotMyVbucket,
            RetryReason::KvCollectionOutdated,
            RetryReason::ViewsNoActivePartition,
        ] {
            assert_eq!(decide(reason, false), RetryDecision::Retry);
        }
    }

    #[test]
    fn never_retry_reasons_surface_even_when_idempotent() {
        for reason in [
            RetryReason::SocketClosedWhileInFlight,
            RetryReason::Unknown,
            RetryReason::DoNotRetry,
        ] {
            assert_eq!(decide(reason, true), RetryDecision::Surface);
        }
    }

    #[test]
    fn conditional_reasons_follow_idempotency() {
        assert_eq!(decide(RetryReason::KvTemporaryFailure, true), RetryDecision::Retry);
        assert_eq!(decide(RetryReason::KvTemporaryFailure, false), RetryDecision::Surface);
    }

    #[test]
    fn backoff_grows_exponentially_then_caps() {
        assert_eq!(backoff_for(0), Duration::from_millis(1));
        assert_eq!(backoff_for(1), Duration::from_millis(2));
        assert_eq!(backoff_for(9), Duration::from_millis(500));
        assert_eq!(backoff_for(30), Duration::from_millis(500));
    }

    proptest::proptest! {
        #[test]
        fn decide_is_always_retry_or_surface(idempotent: bool) {
            let reasons = [
                RetryReason::KvNotMyVbucket,
                RetryReason::ServiceNotAvailable,
                RetryReason::SocketClosedWhileInFlight,
            ];
            for reason in reasons {
                let decision = decide(reason, idempotent);
                prop_assert!(matches!(decision, RetryDecision::Retry | RetryDecision::Surface));
            }
        }
    }
}
