//! The Bucket (C5): routes a key to the session owning its partition,
//! queuing requests that arrive before the first configuration lands.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;

use fathom_core::config::Credentials;
use fathom_core::error::{ClientError, CommonError};
use fathom_core::model::{ClusterConfig, NodeConfig, NodePort};
use fathom_transport::{KvSession, TlsConfig};

const CRC32_POLY_TABLE_SIZE: usize = 256;

/// A replica-read selector: `0` reads the active copy's replica slot
/// isn't used here (active reads go through `active_node`), `1..=N`
/// select `partitions[..][index]`, taking an integer selector in
/// `0..N_replicas-1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaSelector(pub usize);

impl ReplicaSelector {
    pub fn validate(self, replica_count: usize) -> Result<Self, ClientError> {
        if self.0 < replica_count {
            Ok(self)
        } else {
            Err(CommonError::InvalidArgument(format!(
                "replica selector {} out of range 0..{}",
                self.0, replica_count
            ))
            .into())
        }
    }
}

/// A queued request waiting for the bucket's first configuration.
struct QueuedRequest {
    key: Vec<u8>,
    resume: Box<dyn FnOnce(i32) + Send>,
}

pub struct Bucket {
    name: String,
    config: Mutex<Option<ClusterConfig>>,
    sessions: Mutex<HashMap<i32, KvSession>>,
    pending: Mutex<VecDeque<QueuedRequest>>,
}

impl Bucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `partition = CRC32(key) mod N_partitions`.
    pub fn partition_for(&self, key: &[u8]) -> Option<usize> {
        let config = self.config.lock().expect("poisoned");
        let config = config.as_ref()?;
        let n = config.partition_count();
        Some(crc32(key) as usize % n)
    }

    /// The active node index for `key`'s partition, or `None` if no
    /// configuration has arrived yet, or the partition row isn't
    /// assigned (`-1`).
    pub fn active_node(&self, key: &[u8]) -> Option<i32> {
        let config = self.config.lock().expect("poisoned");
        let config = config.as_ref()?;
        let partition = crc32(key) as usize % config.partition_count();
        let active = config.partitions.active(partition)?;
        if active < 0 {
            None
        } else {
            Some(active)
        }
    }

    pub fn replica_node(&self, key: &[u8], selector: ReplicaSelector) -> Result<Option<i32>, ClientError> {
        let config = self.config.lock().expect("poisoned");
        let config = config.as_ref().ok_or_else(|| {
            ClientError::from(CommonError::ServiceNotAvailable)
        })?;
        let partition = crc32(key) as usize % config.partition_count();
        let replica_count = config.partitions.replica_count(partition);
        selector.validate(replica_count)?;
        Ok(config.partitions.replica(partition, selector.0))
    }

    /// Decode a `not_my_vbucket` response body as a configuration and
    /// adopt it if newer. An empty or non-JSON body just means the
    /// server didn't attach one; that's not an error here, the caller
    /// still gets to retry against whatever config it already has.
    pub fn adopt_config_from_body(&self, body: &[u8]) -> bool {
        if body.is_empty() {
            return false;
        }
        match fathom_codec::decode_cluster_config(body) {
            Ok(config) => self.adopt_config(config),
            Err(err) => {
                tracing::debug!(error = %err, "not_my_vbucket body wasn't a decodable configuration");
                false
            }
        }
    }

    /// Replace the configuration wholesale if it's strictly newer, then
    /// drain whatever requests
    /// queued before the first config arrived.
    pub fn adopt_config(&self, new_config: ClusterConfig) -> bool {
        let mut config = self.config.lock().expect("poisoned");
        let should_adopt = match config.as_ref() {
            Some(current) => new_config.supersedes(current),
            None => true,
        };
        if !should_adopt {
            return false;
        }
        *config = Some(new_config);
        drop(config);
        self.drain_pending();
        true
    }

    /// Open this bucket's key-value sessions: connect to `seed_addr`
    /// first (selecting this bucket on that connection, which also
    /// fetches the initial cluster configuration), adopt the
    /// configuration it returns, then connect to every other node the
    /// configuration names.
    ///
    /// A node this client fails to reach during the fan-out is logged
    /// and skipped rather than failing the whole bootstrap: a partially
    /// connected bucket can still serve keys whose active node is
    /// reachable, and `submit_kv`'s `NodeNotAvailable` failure already
    /// covers the rest.
    pub async fn bootstrap(
        &self,
        seed_hostname: &str,
        seed_addr: SocketAddr,
        tls: Option<&TlsConfig>,
        credentials: &Credentials,
        network: &str,
    ) -> Result<(), ClientError> {
        let (seed_session, config) = KvSession::connect(seed_hostname, seed_addr, tls, credentials, Some(&self.name))
            .await
            .map_err(|err| ClientError::from(CommonError::Internal(err.to_string())))?;
        let config = config.ok_or_else(|| {
            ClientError::from(CommonError::Internal(
                "bucket selection handshake did not return a cluster configuration".to_string(),
            ))
        })?;

        let seed_index = find_node_index(&config, seed_hostname, network);
        if let Some(index) = seed_index {
            self.register_session(index, seed_session);
        }

        for (index, node) in config.nodes.iter().enumerate() {
            if seed_index == Some(index as i32) {
                continue;
            }
            let Some(addr) = resolve_node_addr(node, network, tls.is_some()) else {
                tracing::warn!(node = node.hostname(network), "no kv port advertised for this network, skipping");
                continue;
            };
            let hostname = node.hostname(network).to_string();
            match KvSession::connect(&hostname, addr, tls, credentials, Some(&self.name)).await {
                Ok((session, _)) => self.register_session(index as i32, session),
                Err(err) => {
                    tracing::warn!(node = %hostname, error = %err, "failed to connect to node during bucket bootstrap");
                }
            }
        }

        self.adopt_config(config);
        Ok(())
    }

    pub fn register_session(&self, node_index: i32, session: KvSession) {
        self.sessions.lock().expect("poisoned").insert(node_index, session);
    }

    pub fn session_for_node(&self, node_index: i32) -> Option<KvSession> {
        self.sessions.lock().expect("poisoned").get(&node_index).cloned()
    }

    /// Defer a request that arrived while reconfiguration is in
    /// progress or before bootstrap completed.
    pub fn queue_until_configured(&self, key: Vec<u8>, resume: impl FnOnce(i32) + Send + 'static) {
        self.pending.lock().expect("poisoned").push_back(QueuedRequest {
            key,
            resume: Box::new(resume),
        });
    }

    fn drain_pending(&self) {
        let mut queue = self.pending.lock().expect("poisoned");
        let ready: Vec<QueuedRequest> = queue.drain(..).collect();
        drop(queue);
        for request in ready {
            if let Some(node) = self.active_node(&request.key) {
                (request.resume)(node);
            } else {
                self.pending.lock().expect("poisoned").push_back(request);
            }
        }
    }
}

/// The index into `config.nodes` whose hostname on `network` matches
/// `hostname`, if any, so the node this client already has a live
/// socket to isn't connected to a second time during bootstrap.
fn find_node_index(config: &ClusterConfig, hostname: &str, network: &str) -> Option<i32> {
    config
        .nodes
        .iter()
        .position(|node| node.hostname(network) == hostname)
        .map(|index| index as i32)
}

fn resolve_node_addr(node: &NodeConfig, network: &str, tls: bool) -> Option<SocketAddr> {
    let port = node.port(if tls { NodePort::KvTls } else { NodePort::Kv }, network)?;
    format!("{}:{}", node.hostname(network), port).parse().ok()
}

/// CRC-32 (IEEE 802.3 polynomial), used for partition routing.
/// Implemented directly rather than pulled in as a dependency:
/// it's a few lines and the only checksum this client needs.
fn crc32(data: &[u8]) -> u32 {
    static TABLE: [u32; CRC32_POLY_TABLE_SIZE] = build_table();
    let mut crc = 0xffffffffu32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xff) as usize;
        crc = (crc >> 8) ^ TABLE[index];
    }
    !crc
}

const fn build_table() -> [u32; CRC32_POLY_TABLE_SIZE] {
    let mut table = [0u32; CRC32_POLY_TABLE_SIZE];
    let mut i = 0;
    while i < CRC32_POLY_TABLE_SIZE {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xedb88320 } else { crc >> 1 };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_core::model::{ConfigVersion, PartitionMap};

    #[test]
    fn crc32_matches_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xcbf43926);
    }

    #[test]
    fn replica_selector_out_of_range_is_invalid_argument() {
        let err = ReplicaSelector(3).validate(2).unwrap_err();
        assert_eq!(err.category(), fathom_core::error::ErrorCategory::Common);
    }

    #[test]
    fn active_node_is_none_before_first_config() {
        let bucket = Bucket::new("b");
        assert_eq!(bucket.active_node(b"hello"), None);
    }

    #[test]
    fn adopt_config_ignores_stale_versions() {
        let bucket = Bucket::new("b");
        let config = ClusterConfig {
            version: ConfigVersion::new(1, 2),
            partitions: PartitionMap::new(vec![vec![0, 1]]),
            ..Default::default()
        };
        assert!(bucket.adopt_config(config.clone()));
        assert!(!bucket.adopt_config(config));
    }

    #[test]
    fn not_my_vbucket_body_without_json_is_ignored_not_an_error() {
        let bucket = Bucket::new("b");
        assert!(!bucket.adopt_config_from_body(b""));
        assert!(!bucket.adopt_config_from_body(b"not json"));
    }

    #[test]
    fn not_my_vbucket_body_with_newer_config_is_adopted() {
        let bucket = Bucket::new("b");
        let body = br#"{"rev": 3, "revEpoch": 1, "nodesExt": [], "vBucketServerMap": {"vBucketMap": [[0]]}}"#;
        assert!(bucket.adopt_config_from_body(body));
        assert_eq!(bucket.active_node(b"any-key"), Some(0));
    }

    #[test]
    fn find_node_index_matches_on_the_requested_network() {
        let config = ClusterConfig {
            nodes: vec![
                NodeConfig { hostname: "10.0.0.1".to_string(), ..Default::default() },
                NodeConfig { hostname: "10.0.0.2".to_string(), ..Default::default() },
            ],
            ..Default::default()
        };
        assert_eq!(find_node_index(&config, "10.0.0.2", "default"), Some(1));
        assert_eq!(find_node_index(&config, "unknown-host", "default"), None);
    }

    #[test]
    fn resolve_node_addr_is_none_without_a_kv_port() {
        let node = NodeConfig { hostname: "10.0.0.1".to_string(), ..Default::default() };
        assert_eq!(resolve_node_addr(&node, "default", false), None);
    }

    #[test]
    fn resolve_node_addr_builds_a_socket_addr_from_hostname_and_port() {
        let mut node = NodeConfig { hostname: "127.0.0.1".to_string(), ..Default::default() };
        node.ports.insert(NodePort::Kv, 11210);
        assert_eq!(resolve_node_addr(&node, "default", false), Some("127.0.0.1:11210".parse().unwrap()));
    }

    #[test]
    fn queued_requests_drain_once_config_arrives() {
        let bucket = Bucket::new("b");
        let resumed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let resumed_clone = resumed.clone();
        bucket.queue_until_configured(b"k".to_vec(), move |_node| {
            resumed_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(!resumed.load(std::sync::atomic::Ordering::SeqCst));

        let config = ClusterConfig {
            version: ConfigVersion::new(1, 1),
            partitions: PartitionMap::new(vec![vec![0]; 1024]),
            ..Default::default()
        };
        bucket.adopt_config(config);
        assert!(resumed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
