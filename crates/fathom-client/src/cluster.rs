//! The Cluster (C6): owns the HTTP pool, the per-bucket key-value
//! sessions, and network-selector auto-detection. `submit_kv` and
//! `submit_http` are the two entry points every higher-level operation
//! dispatches through; both route to "no such bucket" or "no service
//! reachable" before ever touching the wire.

use std::collections::HashMap;

use fathom_core::config::{Credentials, NetworkSelector};
use fathom_core::contract::Deadline;
use fathom_core::error::{ClientError, CommonError, OperationError};
use fathom_core::ids::DocumentId;
use fathom_core::model::NodeConfig;
use fathom_core::RequestContext;
use fathom_transport::http::{HttpRequest, HttpResponse};
use fathom_transport::{HttpPool, ServiceFamily, TlsConfig};

use crate::orchestrator::OrchestratorOutcome;
use crate::submit::{self, KvOperation};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkSelection {
    Default,
    External(String),
}

impl NetworkSelection {
    pub fn label(&self) -> &'static str {
        match self {
            NetworkSelection::Default => "default",
            NetworkSelection::External(_) => "external",
        }
    }
}

impl std::fmt::Display for NetworkSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkSelection::Default => write!(f, "default"),
            NetworkSelection::External(name) => write!(f, "external:{name}"),
        }
    }
}

/// Decide which network a node's addresses should be read from. `Auto`
/// compares `bootstrap_host` against each node's default/alternate-address
/// hostnames using plain string equality; a tie (the bootstrap host isn't
/// found anywhere) falls back to `default`.
pub fn detect_network(
    selector: NetworkSelector,
    bootstrap_host: &str,
    nodes: &[NodeConfig],
) -> NetworkSelection {
    match selector {
        NetworkSelector::Default => NetworkSelection::Default,
        NetworkSelector::External => nodes
            .iter()
            .find_map(|n| n.alternate.keys().next().cloned())
            .map(NetworkSelection::External)
            .unwrap_or(NetworkSelection::Default),
        NetworkSelector::Auto => {
            for node in nodes {
                if node.hostname == bootstrap_host {
                    return NetworkSelection::Default;
                }
                for (name, alt) in &node.alternate {
                    if alt.hostname == bootstrap_host {
                        return NetworkSelection::External(name.clone());
                    }
                }
            }
            NetworkSelection::Default
        }
    }
}

/// Top-level cluster handle: the HTTP pool shared by every bucket plus
/// the buckets themselves, keyed by name.
pub struct Cluster {
    pub http: HttpPool,
    bootstrap_host: String,
    network: NetworkSelection,
    buckets: HashMap<String, crate::bucket::Bucket>,
    credentials: Credentials,
    tls: Option<TlsConfig>,
}

impl Cluster {
    pub fn new(bootstrap_host: impl Into<String>, credentials: Credentials, tls: Option<TlsConfig>) -> Self {
        Self {
            http: HttpPool::new(tls.clone()),
            bootstrap_host: bootstrap_host.into(),
            network: NetworkSelection::Default,
            buckets: HashMap::new(),
            credentials,
            tls,
        }
    }

    pub fn bootstrap_host(&self) -> &str {
        &self.bootstrap_host
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    pub fn set_network(&mut self, selector: NetworkSelector, nodes: &[NodeConfig]) {
        self.network = detect_network(selector, &self.bootstrap_host, nodes);
    }

    pub fn network(&self) -> NetworkSelection {
        self.network.clone()
    }

    pub fn open_bucket(&mut self, name: &str) -> &crate::bucket::Bucket {
        self.buckets
            .entry(name.to_string())
            .or_insert_with(|| crate::bucket::Bucket::new(name))
    }

    pub fn bucket(&self, name: &str) -> Option<&crate::bucket::Bucket> {
        self.buckets.get(name)
    }

    /// Route a key-value operation to `bucket_name`, surfacing
    /// `BucketNotFound` immediately if no such bucket has been opened
    /// rather than letting it fail further downstream as a missing node.
    pub async fn submit_kv(
        &self,
        bucket_name: &str,
        document: &DocumentId,
        operation: &KvOperation,
        deadline: Deadline,
    ) -> OrchestratorOutcome<fathom_codec::header::Frame> {
        match self.bucket(bucket_name) {
            Some(bucket) => submit::submit_kv(bucket, document, operation, deadline).await,
            None => OrchestratorOutcome::Failed(OperationError::new(
                ClientError::from(CommonError::BucketNotFound(bucket_name.to_string())),
                RequestContext::new(),
            )),
        }
    }

    /// Dispatch an HTTP request against `family`'s pool, wiring in the
    /// mandatory auth/identity headers before it ever reaches the wire.
    pub async fn submit_http(
        &self,
        family: ServiceFamily,
        method: impl Into<String>,
        path: impl Into<String>,
        idempotent: bool,
        deadline: Deadline,
    ) -> OrchestratorOutcome<HttpResponse> {
        let request = HttpRequest::for_dispatch(method, path, &self.credentials);
        submit::submit_http(&self.http, family, &request, idempotent, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_core::model::AlternateAddresses;

    fn node(hostname: &str, alt: Option<(&str, &str)>) -> NodeConfig {
        let mut n = NodeConfig {
            hostname: hostname.to_string(),
            ..Default::default()
        };
        if let Some((name, alt_host)) = alt {
            n.alternate.insert(
                name.to_string(),
                AlternateAddresses {
                    hostname: alt_host.to_string(),
                    ports: Default::default(),
                },
            );
        }
        n
    }

    #[test]
    fn default_selector_always_picks_default() {
        let nodes = [node("10.0.0.1", Some(("external", "1.2.3.4")))];
        assert_eq!(
            detect_network(NetworkSelector::Default, "1.2.3.4", &nodes),
            NetworkSelection::Default
        );
    }

    #[test]
    fn auto_matches_bootstrap_host_against_alternate_addresses() {
        let nodes = [node("10.0.0.1", Some(("external", "bootstrap.example.com")))];
        assert_eq!(
            detect_network(NetworkSelector::Auto, "bootstrap.example.com", &nodes),
            NetworkSelection::External("external".to_string())
        );
    }

    #[test]
    fn auto_falls_back_to_default_on_no_match() {
        let nodes = [node("10.0.0.1", Some(("external", "1.2.3.4")))];
        assert_eq!(
            detect_network(NetworkSelector::Auto, "unrelated-host", &nodes),
            NetworkSelection::Default
        );
    }

    #[tokio::test]
    async fn submit_kv_surfaces_bucket_not_found_for_an_unopened_bucket() {
        let cluster = Cluster::new("10.0.0.1", Credentials::new("user", "pass"), None);
        let document = DocumentId::new("unknown", b"k".to_vec());
        let operation = KvOperation {
            opcode: fathom_codec::opcodes::GET,
            extras: bytes::Bytes::new(),
            value: bytes::Bytes::new(),
            idempotent: true,
            snappy_enabled: false,
        };
        let outcome = cluster
            .submit_kv("unknown", &document, &operation, Deadline::none())
            .await;
        match outcome {
            OrchestratorOutcome::Failed(op_err) => {
                assert_eq!(
                    op_err.error,
                    ClientError::from(CommonError::BucketNotFound("unknown".to_string()))
                );
            }
            _ => panic!("expected bucket-not-found failure"),
        }
    }
}
