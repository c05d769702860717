//! One long-lived key-value connection: drives the handshake, then owns
//! an opaque-keyed in-flight table and the reader/writer loop.
//!
//! ## Why
//! A key-value socket is useless until HELLO, error-map retrieval, SASL
//! authentication, and (for a bucket-scoped session) bucket selection
//! have all run in order; folding that sequence into `connect` means
//! every caller gets a session that is either fully `Ready` or a
//! reported error, never something half-negotiated.
//!
//! ## How
//! `Arc<Inner>` wraps an `AsyncMutex<BoxedStream>` so `&self` methods can
//! run concurrently, with a background task doing the actual socket
//! reads and dispatching each decoded frame to whichever `submit` call
//! is waiting on its opaque. The handshake steps reuse that same
//! `submit` path rather than a separate blocking protocol, so a stalled
//! server fails them via the normal deadline machinery.
//!
//! ## What
//! `connect` returns a session in state `Ready` and, when a bucket was
//! requested, the cluster configuration fetched as the last handshake
//! step. Every other operation on the session assumes that contract.
//!
//! ## Trade-offs
//! The handshake runs its steps strictly sequentially; pipelining HELLO
//! and SASL mechanism listing would save one round trip but would also
//! make the state machine harder to follow for a cost that only matters
//! on the first connection to a node, not on the steady-state hot path.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use fathom_codec::header::{DecodeError, Frame, Magic};
use fathom_codec::opcodes;
use fathom_core::config::Credentials;
use fathom_core::contract::Deadline;
use fathom_core::identity;
use fathom_core::ids::{Opaque, OpaqueAllocator};
use fathom_core::model::ClusterConfig;
use fathom_core::status::ErrorMap;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::kv::collections::CollectionCache;
use crate::kv::handshake::{hello_request_body, parse_negotiated_features, Feature};
use crate::scram::{Mechanism, ScramClient};
use crate::state::SessionState;
use crate::stream::BoxedStream;
use crate::tls::TlsConfig;

/// The status code a server replies with while a SASL exchange still
/// needs another step. Not a general key-value status, so it has no
/// place in `fathom_core::status::KvStatus`.
const SASL_AUTH_CONTINUE: u16 = 0x21;

#[derive(Clone, Debug, Error)]
pub enum KvSessionError {
    #[error("io error: {0}")]
    Io(String),
    #[error("operation timed out")]
    Timeout,
    #[error("session closed")]
    SessionClosed,
    #[error("invalid frame, stream unrecoverable: {0}")]
    Protocol(String),
}

impl From<DecodeError> for KvSessionError {
    fn from(err: DecodeError) -> Self {
        KvSessionError::Protocol(err.to_string())
    }
}

struct PendingOperation {
    tx: oneshot::Sender<Result<Frame, KvSessionError>>,
}

struct Inner {
    stream: AsyncMutex<BoxedStream>,
    state: StdMutex<SessionState>,
    opaque_alloc: OpaqueAllocator,
    in_flight: DashMap<u32, PendingOperation>,
    error_map: StdMutex<Option<ErrorMap>>,
    negotiated_features: StdMutex<HashSet<Feature>>,
    collections: CollectionCache,
    peer: SocketAddr,
}

impl Inner {
    fn dispatch(&self, frame: Frame) {
        if let Some((_, pending)) = self.in_flight.remove(&frame.header.opaque) {
            let _ = pending.tx.send(Ok(frame));
            return;
        }
        match frame.header.magic {
            Magic::ServerPush => {
                tracing::debug!(
                    opaque = frame.header.opaque,
                    peer = %self.peer,
                    "server-pushed frame received, routing to config/heartbeat handling"
                );
            }
            _ => {
                tracing::warn!(
                    opaque = frame.header.opaque,
                    peer = %self.peer,
                    "discarding frame for an opaque with no pending operation"
                );
            }
        }
    }

    fn fail_all_in_flight(&self, error: KvSessionError) {
        let keys: Vec<u32> = self.in_flight.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, pending)) = self.in_flight.remove(&key) {
                let _ = pending.tx.send(Err(error.clone()));
            }
        }
    }
}

/// A handle to one key-value session. Cheap to clone; every clone shares
/// the same connection, in-flight table, and background reader task.
#[derive(Clone)]
pub struct KvSession {
    inner: Arc<Inner>,
}

impl KvSession {
    /// Open a TCP (optionally TLS) connection to `peer` and drive it
    /// through HELLO, error-map retrieval, SASL authentication, and,
    /// when `bucket` is given, bucket selection followed by a cluster
    /// configuration fetch. Returns a session already in state `Ready`.
    pub async fn connect(
        hostname: &str,
        peer: SocketAddr,
        tls: Option<&TlsConfig>,
        credentials: &Credentials,
        bucket: Option<&str>,
    ) -> Result<(Self, Option<ClusterConfig>), KvSessionError> {
        let tcp = TcpStream::connect(peer)
            .await
            .map_err(|e| KvSessionError::Io(e.to_string()))?;
        tcp.set_nodelay(true).map_err(|e| KvSessionError::Io(e.to_string()))?;

        let stream: BoxedStream = match tls {
            Some(tls) => tls
                .connect(tcp, hostname)
                .await
                .map_err(|e| KvSessionError::Io(e.to_string()))?,
            None => Box::new(tcp),
        };

        let inner = Arc::new(Inner {
            stream: AsyncMutex::new(stream),
            state: StdMutex::new(SessionState::Connecting),
            opaque_alloc: OpaqueAllocator::new(),
            in_flight: DashMap::new(),
            error_map: StdMutex::new(None),
            negotiated_features: StdMutex::new(HashSet::new()),
            collections: CollectionCache::new(),
            peer,
        });

        Self::spawn_reader(inner.clone());
        let session = Self { inner };

        session.hello().await?;
        session.fetch_error_map().await?;
        session.authenticate(credentials).await?;

        let config = match bucket {
            Some(bucket) => {
                session.select_bucket(bucket).await?;
                session.mark_ready();
                Some(session.fetch_cluster_config().await?)
            }
            None => {
                session.mark_ready();
                None
            }
        };

        Ok((session, config))
    }

    async fn hello(&self) -> Result<(), KvSessionError> {
        self.mark_handshaking();
        let frame = self
            .send_handshake_frame(opcodes::HELLO, identity::user_agent().as_bytes(), &hello_request_body())
            .await?;
        if frame.header.status_or_partition != 0x00 {
            return Err(KvSessionError::Protocol(format!(
                "HELLO rejected with status {:#06x}",
                frame.header.status_or_partition
            )));
        }
        self.set_negotiated_features(parse_negotiated_features(&frame.value));
        Ok(())
    }

    /// Non-fatal: a server that refuses `get_error_map` just leaves this
    /// session without server-authoritative retry reclassification.
    async fn fetch_error_map(&self) -> Result<(), KvSessionError> {
        let frame = self
            .send_handshake_frame(opcodes::GET_ERROR_MAP, &[], &2u16.to_be_bytes())
            .await?;
        if frame.header.status_or_partition == 0x00 {
            match fathom_codec::error_map::decode_error_map(&frame.value) {
                Ok(map) => self.set_error_map(map),
                Err(err) => tracing::warn!(peer = %self.inner.peer, error = %err, "discarding unparsable error map"),
            }
        }
        Ok(())
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<(), KvSessionError> {
        self.mark_authenticating();

        let mechs_frame = self
            .send_handshake_frame(opcodes::SASL_LIST_MECHS, &[], &[])
            .await?;
        let offered_raw = String::from_utf8_lossy(&mechs_frame.value);
        let offered: Vec<&str> = offered_raw.split_whitespace().collect();
        let mechanism = Mechanism::negotiate(&offered)
            .ok_or_else(|| KvSessionError::Protocol("no supported SASL mechanism offered by server".into()))?;

        let mut scram = ScramClient::new(mechanism, &credentials.username, &credentials.password);
        let first = scram.client_first_message();
        let challenge = self
            .send_handshake_frame(opcodes::SASL_AUTH, mechanism.name().as_bytes(), first.as_bytes())
            .await?;
        if challenge.header.status_or_partition != SASL_AUTH_CONTINUE {
            return Err(KvSessionError::Protocol(format!(
                "SASL authentication failed with status {:#06x}",
                challenge.header.status_or_partition
            )));
        }

        let server_first = std::str::from_utf8(&challenge.value)
            .map_err(|_| KvSessionError::Protocol("non-utf8 SASL challenge".into()))?;
        let client_final = scram
            .handle_server_first(server_first)
            .map_err(|err| KvSessionError::Protocol(err.to_string()))?;

        let final_frame = self
            .send_handshake_frame(opcodes::SASL_STEP, mechanism.name().as_bytes(), client_final.as_bytes())
            .await?;
        if final_frame.header.status_or_partition != 0x00 {
            return Err(KvSessionError::Protocol(format!(
                "SASL authentication failed with status {:#06x}",
                final_frame.header.status_or_partition
            )));
        }

        let server_final = std::str::from_utf8(&final_frame.value)
            .map_err(|_| KvSessionError::Protocol("non-utf8 SASL server-final message".into()))?;
        scram
            .verify_server_final(server_final)
            .map_err(|err| KvSessionError::Protocol(err.to_string()))
    }

    async fn select_bucket(&self, bucket: &str) -> Result<(), KvSessionError> {
        self.mark_selecting_bucket();
        let frame = self
            .send_handshake_frame(opcodes::SELECT_BUCKET, bucket.as_bytes(), &[])
            .await?;
        if frame.header.status_or_partition != 0x00 {
            return Err(KvSessionError::Protocol(format!(
                "bucket selection rejected with status {:#06x}",
                frame.header.status_or_partition
            )));
        }
        Ok(())
    }

    async fn fetch_cluster_config(&self) -> Result<ClusterConfig, KvSessionError> {
        let frame = self
            .send_handshake_frame(opcodes::GET_CLUSTER_CONFIG, &[], &[])
            .await?;
        if frame.header.status_or_partition != 0x00 {
            return Err(KvSessionError::Protocol(format!(
                "cluster configuration fetch rejected with status {:#06x}",
                frame.header.status_or_partition
            )));
        }
        fathom_codec::cluster_config::decode_cluster_config(&frame.value)
            .map_err(|err| KvSessionError::Protocol(err.to_string()))
    }

    async fn send_handshake_frame(&self, opcode: u8, key: &[u8], value: &[u8]) -> Result<Frame, KvSessionError> {
        let opaque = self.allocate_opaque();
        let encoded =
            Frame::encode_request(Magic::ClassicRequest, opcode, opaque.0, 0, 0, &[], &[], key, value, false)
                .freeze();
        self.submit(opaque, encoded, Deadline::none()).await
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().expect("state mutex poisoned")
    }

    fn transition(&self, target: SessionState) {
        let mut state = self.inner.state.lock().expect("state mutex poisoned");
        if state.can_transition_to(target) {
            tracing::debug!(peer = %self.inner.peer, from = ?*state, to = ?target, "session state transition");
            *state = target;
        } else {
            tracing::warn!(peer = %self.inner.peer, from = ?*state, to = ?target, "rejected illegal session state transition");
        }
    }

    pub fn set_negotiated_features(&self, features: HashSet<Feature>) {
        *self.inner.negotiated_features.lock().expect("poisoned") = features;
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.inner
            .negotiated_features
            .lock()
            .expect("poisoned")
            .contains(&feature)
    }

    pub fn set_error_map(&self, map: ErrorMap) {
        *self.inner.error_map.lock().expect("poisoned") = Some(map);
    }

    pub fn error_map_indicates_retry(&self, status: u16) -> bool {
        self.inner
            .error_map
            .lock()
            .expect("poisoned")
            .as_ref()
            .map(|map| map.indicates_retry(status))
            .unwrap_or(false)
    }

    pub fn mark_handshaking(&self) {
        self.transition(SessionState::Handshaking);
    }

    pub fn mark_authenticating(&self) {
        self.transition(SessionState::Authenticating);
    }

    pub fn mark_selecting_bucket(&self) {
        self.transition(SessionState::SelectingBucket);
    }

    pub fn mark_ready(&self) {
        self.transition(SessionState::Ready);
    }

    pub fn allocate_opaque(&self) -> Opaque {
        self.inner.opaque_alloc.next()
    }

    /// A cached numeric id for `path` ("scope.collection"), if this
    /// session has already resolved it.
    pub fn resolved_collection(&self, path: &str) -> Option<u32> {
        self.inner.collections.get(path)
    }

    pub fn cache_collection(&self, path: String, id: u32) {
        self.inner.collections.insert(path, id);
    }

    /// Drop a cached id after the server reports it unknown, starting
    /// this path's backoff window.
    pub fn invalidate_collection(&self, path: &str) {
        self.inner.collections.invalidate(path);
    }

    pub fn collection_ready_to_resolve(&self, path: &str) -> bool {
        self.inner.collections.ready_to_resolve(path)
    }

    /// Write `encoded` and park a completion handle under `opaque` in
    /// the in-flight table, then wait for the response or the deadline,
    /// whichever comes first.
    pub async fn submit(
        &self,
        opaque: Opaque,
        encoded: Bytes,
        deadline: Deadline,
    ) -> Result<Frame, KvSessionError> {
        let (tx, rx) = oneshot::channel();
        self.inner.in_flight.insert(opaque.0, PendingOperation { tx });

        if let Err(err) = self.write_frame(&encoded).await {
            self.inner.in_flight.remove(&opaque.0);
            return Err(err);
        }

        let outcome = match deadline.instant() {
            Some(instant) => {
                tokio::time::timeout_at(tokio::time::Instant::from_std(instant), rx).await
            }
            None => Ok(rx.await),
        };

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => Err(KvSessionError::SessionClosed),
            Err(_elapsed) => {
                self.inner.in_flight.remove(&opaque.0);
                Err(KvSessionError::Timeout)
            }
        }
    }

    async fn write_frame(&self, encoded: &[u8]) -> Result<(), KvSessionError> {
        let mut stream = self.inner.stream.lock().await;
        stream
            .write_all(encoded)
            .await
            .map_err(|e| KvSessionError::Io(e.to_string()))
    }

    /// Explicit cancellation:
    /// fail every pending operation with a session-wide ambiguous
    /// outcome and move to `Closing`.
    pub fn close(&self) {
        self.transition(SessionState::Closing);
        self.inner.fail_all_in_flight(KvSessionError::SessionClosed);
        self.transition(SessionState::Closed);
    }

    fn spawn_reader(inner: Arc<Inner>) {
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(16 * 1024);
            loop {
                let read = {
                    let mut stream = inner.stream.lock().await;
                    stream.read_buf(&mut buf).await
                };
                match read {
                    Ok(0) => {
                        inner.fail_all_in_flight(KvSessionError::SessionClosed);
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        inner.fail_all_in_flight(KvSessionError::Io(err.to_string()));
                        return;
                    }
                }

                loop {
                    match Frame::try_decode(&mut buf) {
                        Ok(Some(frame)) => inner.dispatch(frame),
                        Ok(None) => break,
                        Err(err) => {
                            tracing::warn!(peer = %inner.peer, error = %err, "discarding buffer after invalid frame magic");
                            buf.clear();
                            inner.fail_all_in_flight(KvSessionError::Protocol(err.to_string()));
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_follow_the_handshake_order() {
        let state = StdMutex::new(SessionState::Connecting);
        assert!(state.lock().unwrap().can_transition_to(SessionState::Handshaking));
    }

    #[test]
    fn bucket_less_handshake_can_reach_ready_from_authenticating() {
        let state = StdMutex::new(SessionState::Authenticating);
        assert!(state.lock().unwrap().can_transition_to(SessionState::Ready));
    }
}
