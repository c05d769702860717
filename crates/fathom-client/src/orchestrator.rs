//! The retry orchestrator (C7) wired into real timers: given a classify
//! step the caller supplies per attempt, drives backoff and deadline
//! checks until the operation succeeds, surfaces, or the deadline
//! passes.

use fathom_core::contract::Deadline;
use fathom_core::error::{ClientError, CommonError, OperationError};
use fathom_core::ids::Opaque;
use fathom_core::retry::{backoff_for, decide, RetryDecision, RetryReason};
use fathom_core::RequestContext;

/// What one attempt produced, as seen by the orchestrator.
pub enum AttemptOutcome<T> {
    Success(T),
    Failed { reason: RetryReason, error: ClientError },
}

pub enum OrchestratorOutcome<T> {
    Success(T),
    Failed(OperationError),
}

pub struct Orchestrator {
    idempotent: bool,
    deadline: Deadline,
    opaque: Option<Opaque>,
}

impl Orchestrator {
    pub fn new(idempotent: bool, deadline: Deadline) -> Self {
        Self {
            idempotent,
            deadline,
            opaque: None,
        }
    }

    pub fn with_opaque(mut self, opaque: Opaque) -> Self {
        self.opaque = Some(opaque);
        self
    }

    /// Drive `attempt` until it reports success, a non-retryable
    /// failure, or the deadline expires. `attempt` is handed the
    /// 0-based attempt index so it can re-encode/re-dispatch as needed.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> OrchestratorOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = AttemptOutcome<T>>,
    {
        let mut context = RequestContext::new();
        context.opaque = self.opaque;
        let mut attempt_index = 0u32;

        loop {
            if self.deadline.is_expired() {
                let error = if attempt_index == 0 {
                    CommonError::UnambiguousTimeout
                } else {
                    CommonError::AmbiguousTimeout
                };
                return OrchestratorOutcome::Failed(OperationError::new(error, context));
            }

            match attempt(attempt_index).await {
                AttemptOutcome::Success(value) => return OrchestratorOutcome::Success(value),
                AttemptOutcome::Failed { reason, error } => {
                    context.record_retry(reason);
                    match decide(reason, self.idempotent) {
                        RetryDecision::Surface => {
                            return OrchestratorOutcome::Failed(OperationError::new(error, context));
                        }
                        RetryDecision::Retry => {
                            let wait = backoff_for(attempt_index);
                            match self.deadline.remaining() {
                                Some(remaining) if remaining < wait => {
                                    return OrchestratorOutcome::Failed(OperationError::new(
                                        CommonError::AmbiguousTimeout,
                                        context,
                                    ));
                                }
                                _ => {
                                    tokio::time::sleep(wait).await;
                                    attempt_index += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn succeeds_immediately_without_retrying() {
        let orchestrator = Orchestrator::new(true, Deadline::none());
        let outcome = orchestrator
            .run(|_attempt| async { AttemptOutcome::Success::<u32>(7) })
            .await;
        assert!(matches!(outcome, OrchestratorOutcome::Success(7)));
    }

    #[tokio::test]
    async fn retries_an_always_retry_reason_then_succeeds() {
        let calls = AtomicU32::new(0);
        let orchestrator = Orchestrator::new(false, Deadline::none());
        let outcome = orchestrator
            .run(|_attempt| {
                let count = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count == 0 {
                        AttemptOutcome::Failed {
                            reason: RetryReason::KvNotMyVbucket,
                            error: fathom_core::error::KeyValueError::NotMyVbucket.into(),
                        }
                    } else {
                        AttemptOutcome::Success(())
                    }
                }
            })
            .await;
        assert!(matches!(outcome, OrchestratorOutcome::Success(())));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_idempotent_conditional_failure_surfaces_immediately() {
        let orchestrator = Orchestrator::new(false, Deadline::none());
        let outcome = orchestrator
            .run(|_attempt| async {
                AttemptOutcome::Failed::<()> {
                    reason: RetryReason::KvTemporaryFailure,
                    error: fathom_core::error::KeyValueError::TemporaryFailure.into(),
                }
            })
            .await;
        match outcome {
            OrchestratorOutcome::Failed(op_err) => assert_eq!(op_err.context.retry_attempts, 1),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn already_expired_deadline_surfaces_unambiguous_timeout_on_first_attempt() {
        let orchestrator = Orchestrator::new(true, Deadline::after(Duration::from_millis(0)));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let outcome = orchestrator
            .run(|_attempt| async { AttemptOutcome::Success::<()>(()) })
            .await;
        match outcome {
            OrchestratorOutcome::Failed(op_err) => {
                assert_eq!(op_err.error, ClientError::from(CommonError::UnambiguousTimeout));
            }
            _ => panic!("expected timeout failure"),
        }
    }
}
