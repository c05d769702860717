//! The public submit entry point: the single call that ties routing
//! (C5), collection resolution and dispatch (C3), and retry (C7)
//! together: caller -> cluster -> bucket (key -> partition -> node) ->
//! session -> wire -> orchestrator (classify) -> caller.

use bytes::Bytes;
use fathom_codec::header::{Frame, Magic};
use fathom_core::contract::Deadline;
use fathom_core::error::{ClientError, CommonError, KeyValueError};
use fathom_core::ids::DocumentId;
use fathom_core::retry::RetryReason;
use fathom_core::status::KvStatus;
use fathom_transport::http::{HttpRequest, HttpResponse};
use fathom_transport::{HttpPool, KvSession, ServiceFamily};

use crate::bucket::Bucket;
use crate::orchestrator::{AttemptOutcome, Orchestrator, OrchestratorOutcome};

/// The opcode plus wire payload a key-value call sends; the caller
/// builds this once, `submit_kv` re-encodes it under a fresh opaque on
/// every attempt.
pub struct KvOperation {
    pub opcode: u8,
    pub extras: Bytes,
    pub value: Bytes,
    pub idempotent: bool,
    pub snappy_enabled: bool,
}

/// Reclassify a key-value response status into the vocabulary the
/// orchestrator's decision table reasons about.
fn classify_status(status: KvStatus) -> Option<(RetryReason, ClientError)> {
    match status {
        KvStatus::Success => None,
        KvStatus::NotFound => Some((RetryReason::DoNotRetry, KeyValueError::DocumentNotFound.into())),
        KvStatus::Exists => Some((RetryReason::DoNotRetry, KeyValueError::DocumentExists.into())),
        KvStatus::NotMyVbucket => Some((RetryReason::KvNotMyVbucket, KeyValueError::NotMyVbucket.into())),
        KvStatus::AuthError => Some((RetryReason::DoNotRetry, CommonError::AuthenticationFailure.into())),
        KvStatus::TemporaryFailure => Some((RetryReason::KvTemporaryFailure, KeyValueError::TemporaryFailure.into())),
        KvStatus::UnknownCollection => Some((
            RetryReason::KvCollectionOutdated,
            KeyValueError::UnknownCollection(String::new()).into(),
        )),
        KvStatus::Locked => Some((RetryReason::KvLocked, KeyValueError::DocumentLocked.into())),
        KvStatus::SyncWriteInProgress => {
            Some((RetryReason::KvSyncWriteInProgress, KeyValueError::SyncWriteInProgress.into()))
        }
        KvStatus::SyncWriteReCommitInProgress => Some((
            RetryReason::KvSyncWriteReCommitInProgress,
            KeyValueError::SyncWriteReCommitInProgress.into(),
        )),
        KvStatus::SubdocPathError(_) => Some((RetryReason::DoNotRetry, KeyValueError::PathError(String::new()).into())),
        KvStatus::Other(code) => Some((RetryReason::Unknown, CommonError::Internal(format!("status {code:#06x}")).into())),
    }
}

fn encode_and_submit_frame<'a>(
    session: &'a KvSession,
    magic: Magic,
    opcode: u8,
    extras: &'a [u8],
    key: &'a [u8],
    value: &'a [u8],
    snappy_enabled: bool,
    deadline: Deadline,
) -> impl std::future::Future<Output = Result<Frame, fathom_transport::kv::session::KvSessionError>> + 'a {
    let opaque = session.allocate_opaque();
    let encoded = Frame::encode_request(magic, opcode, opaque.0, 0, 0, &[], extras, key, value, snappy_enabled);
    session.submit(opaque, encoded.freeze(), deadline)
}

/// Resolve `path` to a numeric collection id on `session`, sending a
/// `get_collection_id` request if the session's cache doesn't already
/// have it. The response's last
/// four extras bytes carry the resolved id, big-endian.
async fn resolve_collection(
    session: &KvSession,
    path: &str,
    deadline: Deadline,
) -> Result<u32, (RetryReason, ClientError)> {
    if let Some(id) = session.resolved_collection(path) {
        return Ok(id);
    }
    if !session.collection_ready_to_resolve(path) {
        return Err((
            RetryReason::KvCollectionOutdated,
            KeyValueError::UnknownCollection(path.to_string()).into(),
        ));
    }

    let frame = encode_and_submit_frame(
        session,
        Magic::AltRequest,
        fathom_codec::opcodes::GET_COLLECTION_ID,
        &[],
        path.as_bytes(),
        &[],
        false,
        deadline,
    )
    .await
    .map_err(|err| (RetryReason::SocketClosedWhileInFlight, CommonError::Internal(err.to_string()).into()))?;

    let status = KvStatus::from(frame.header.status_or_partition);
    if !status.is_success() {
        session.invalidate_collection(path);
        return Err((
            RetryReason::KvCollectionOutdated,
            KeyValueError::UnknownCollection(path.to_string()).into(),
        ));
    }

    let id = frame
        .extras
        .len()
        .checked_sub(4)
        .map(|offset| u32::from_be_bytes(frame.extras[offset..].try_into().unwrap()))
        .ok_or_else(|| {
            (
                RetryReason::Unknown,
                ClientError::from(CommonError::Internal("get_collection_id reply missing id".to_string())),
            )
        })?;

    session.cache_collection(path.to_string(), id);
    Ok(id)
}

/// Route `document` to its active node, resolve its collection if
/// needed, dispatch `operation` over that node's session, and retry per
/// the orchestrator's decision table until success, a non-retryable
/// failure, or `deadline` expires.
///
/// On a `not_my_vbucket` reply the response body is handed to
/// [`Bucket::adopt_config_from_body`] before the orchestrator decides
/// whether to retry, so a retried attempt routes against whatever
/// configuration the server just pushed rather than the stale one.
pub async fn submit_kv(
    bucket: &Bucket,
    document: &DocumentId,
    operation: &KvOperation,
    deadline: Deadline,
) -> OrchestratorOutcome<Frame> {
    let orchestrator = Orchestrator::new(operation.idempotent, deadline);

    orchestrator
        .run(|_attempt| async {
            let node = match bucket.active_node(&document.key) {
                Some(node) => node,
                None => {
                    return AttemptOutcome::Failed {
                        reason: RetryReason::ServiceNotAvailable,
                        error: CommonError::ServiceNotAvailable.into(),
                    }
                }
            };

            let session = match bucket.session_for_node(node) {
                Some(session) => session,
                None => {
                    return AttemptOutcome::Failed {
                        reason: RetryReason::NodeNotAvailable,
                        error: CommonError::NodeNotAvailable.into(),
                    }
                }
            };

            let collection_id = match document.collection.resolved_id() {
                Some(id) => id,
                None => {
                    let path = document.collection_path().unwrap_or_default();
                    match resolve_collection(&session, &path, deadline).await {
                        Ok(id) => id,
                        Err((reason, error)) => return AttemptOutcome::Failed { reason, error },
                    }
                }
            };

            let wire_key = fathom_codec::key::encode(collection_id, &document.key);
            let result = encode_and_submit_frame(
                &session,
                Magic::AltRequest,
                operation.opcode,
                &operation.extras,
                &wire_key,
                &operation.value,
                operation.snappy_enabled,
                deadline,
            )
            .await;

            match result {
                Ok(frame) => {
                    let status = KvStatus::from(frame.header.status_or_partition);
                    match classify_status(status) {
                        None => AttemptOutcome::Success(frame),
                        Some((RetryReason::KvNotMyVbucket, error)) => {
                            bucket.adopt_config_from_body(&frame.value);
                            AttemptOutcome::Failed {
                                reason: RetryReason::KvNotMyVbucket,
                                error,
                            }
                        }
                        Some((RetryReason::KvCollectionOutdated, error)) => {
                            if let Some(path) = document.collection_path() {
                                session.invalidate_collection(&path);
                            }
                            AttemptOutcome::Failed {
                                reason: RetryReason::KvCollectionOutdated,
                                error,
                            }
                        }
                        Some((reason, error)) => AttemptOutcome::Failed { reason, error },
                    }
                }
                Err(err) => AttemptOutcome::Failed {
                    reason: RetryReason::SocketClosedWhileInFlight,
                    error: CommonError::Internal(err.to_string()).into(),
                },
            }
        })
        .await
}

/// Reclassify an HTTP response status line into the vocabulary the
/// orchestrator's decision table reasons about. Anything below 500 is
/// handed back to the caller as-is; 5xx is treated as a service hiccup
/// worth retrying on an idempotent request.
fn classify_http_status(status: u16) -> Option<RetryReason> {
    if status < 500 {
        None
    } else {
        Some(RetryReason::ServiceResponseCodeIndicated)
    }
}

/// Check a session out of `pool` for `family`, dispatch `request`, and
/// retry per the orchestrator's decision table until success, a
/// non-retryable failure, or `deadline` expires. Mirrors [`submit_kv`]'s
/// shape but routes over the HTTP service pool instead of a bucket's
/// key-value sessions.
pub async fn submit_http(
    pool: &HttpPool,
    family: ServiceFamily,
    request: &HttpRequest,
    idempotent: bool,
    deadline: Deadline,
) -> OrchestratorOutcome<HttpResponse> {
    let orchestrator = Orchestrator::new(idempotent, deadline);

    orchestrator
        .run(|_attempt| async {
            let session = match pool.check_out(family).await {
                Ok(session) => session,
                Err(fathom_transport::http::pool::PoolError::NoReachableNode(_)) => {
                    return AttemptOutcome::Failed {
                        reason: RetryReason::ServiceNotAvailable,
                        error: CommonError::ServiceNotAvailable.into(),
                    }
                }
                Err(err) => {
                    return AttemptOutcome::Failed {
                        reason: RetryReason::SocketNotAvailable,
                        error: CommonError::Internal(err.to_string()).into(),
                    }
                }
            };

            match session.submit(request.clone()).await {
                Ok(response) => match classify_http_status(response.status) {
                    None => {
                        pool.check_in(family, session);
                        AttemptOutcome::Success(response)
                    }
                    Some(reason) => {
                        pool.check_in(family, session);
                        AttemptOutcome::Failed {
                            reason,
                            error: CommonError::Internal(format!("http status {}", response.status)).into(),
                        }
                    }
                },
                Err(err) => AttemptOutcome::Failed {
                    reason: RetryReason::SocketClosedWhileInFlight,
                    error: CommonError::Internal(err.to_string()).into(),
                },
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_status_classifies_to_none() {
        assert!(classify_status(KvStatus::Success).is_none());
    }

    #[test]
    fn not_my_vbucket_classifies_as_always_retry() {
        let (reason, _) = classify_status(KvStatus::NotMyVbucket).unwrap();
        assert_eq!(reason, RetryReason::KvNotMyVbucket);
    }

    #[test]
    fn not_found_is_surfaced_not_retried() {
        let (reason, _) = classify_status(KvStatus::NotFound).unwrap();
        assert_eq!(reason, RetryReason::DoNotRetry);
    }

    #[tokio::test]
    async fn submit_http_surfaces_service_not_available_when_pool_has_no_nodes() {
        let pool = HttpPool::default();
        let request = HttpRequest::new("GET", "/admin/ping");
        let outcome = submit_http(&pool, ServiceFamily::Management, &request, true, Deadline::none()).await;
        match outcome {
            OrchestratorOutcome::Failed(op_err) => {
                assert_eq!(op_err.error, ClientError::from(CommonError::ServiceNotAvailable));
            }
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn submit_surfaces_service_not_available_when_bucket_has_no_config() {
        let bucket = Bucket::new("b");
        let document = DocumentId::new("b", b"k".to_vec());
        let operation = KvOperation {
            opcode: fathom_codec::opcodes::GET,
            extras: Bytes::new(),
            value: Bytes::new(),
            idempotent: true,
            snappy_enabled: false,
        };
        let outcome = submit_kv(&bucket, &document, &operation, Deadline::none()).await;
        match outcome {
            OrchestratorOutcome::Failed(op_err) => {
                assert_eq!(op_err.error, ClientError::from(CommonError::ServiceNotAvailable));
            }
            _ => panic!("expected failure"),
        }
    }
}
