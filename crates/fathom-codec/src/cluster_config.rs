//! Decoding a cluster configuration JSON body, the payload a
//! `not_my_vbucket` response (or an explicit `get_cluster_config` call)
//! carries when the server attaches a newer map, adopted if it's newer
//! than the one currently in force.

use std::collections::HashMap;

use fathom_core::model::{AlternateAddresses, Capabilities, ClusterConfig, ConfigVersion, NodeConfig, NodePort, PartitionMap};
use serde::Deserialize;
use thiserror::Error;

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    rev: u64,
    #[serde(rename = "revEpoch", default)]
    rev_epoch: u64,
    #[serde(rename = "nodesExt", default)]
    nodes_ext: Vec<RawNode>,
    #[serde(rename = "vBucketServerMap", default)]
    vbucket_server_map: Option<RawVbucketMap>,
    #[serde(rename = "clusterCapabilities", default)]
    cluster_capabilities: Vec<String>,
    #[serde(rename = "bucketCapabilities", default)]
    bucket_capabilities: Vec<String>,
}

#[derive(Deserialize)]
struct RawVbucketMap {
    #[serde(rename = "vBucketMap", default)]
    vbucket_map: Vec<Vec<i32>>,
}

#[derive(Deserialize)]
struct RawNode {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    services: HashMap<String, u16>,
    #[serde(rename = "alternateAddresses", default)]
    alternate_addresses: HashMap<String, RawAlternate>,
}

#[derive(Deserialize)]
struct RawAlternate {
    hostname: String,
    #[serde(default)]
    ports: HashMap<String, u16>,
}

#[derive(Debug, Error)]
pub enum ConfigDecodeError {
    #[error("malformed cluster configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn named_port(name: &str) -> Option<NodePort> {
    match name {
        "kv" => Some(NodePort::Kv),
        "kvSSL" => Some(NodePort::KvTls),
        "mgmt" => Some(NodePort::Mgmt),
        "mgmtSSL" => Some(NodePort::MgmtTls),
        "n1ql" => Some(NodePort::Query),
        "n1qlSSL" => Some(NodePort::QueryTls),
        "cbas" => Some(NodePort::Analytics),
        "cbasSSL" => Some(NodePort::AnalyticsTls),
        "fts" => Some(NodePort::Search),
        "ftsSSL" => Some(NodePort::SearchTls),
        "capi" => Some(NodePort::Views),
        "capiSSL" => Some(NodePort::ViewsTls),
        _ => None,
    }
}

fn named_ports(raw: &HashMap<String, u16>) -> HashMap<NodePort, u16> {
    raw.iter()
        .filter_map(|(name, port)| named_port(name).map(|p| (p, *port)))
        .collect()
}

/// Decode a cluster configuration JSON body. Unknown service names and
/// capability names are dropped rather than rejected, so a newer server
/// advertising something this client doesn't know about yet never fails
/// config adoption.
pub fn decode_cluster_config(body: &[u8]) -> Result<ClusterConfig, ConfigDecodeError> {
    let raw: RawConfig = serde_json::from_slice(body)?;

    let nodes = raw
        .nodes_ext
        .into_iter()
        .map(|n| NodeConfig {
            hostname: n.hostname,
            ports: named_ports(&n.services),
            alternate: n
                .alternate_addresses
                .into_iter()
                .map(|(name, alt)| {
                    (
                        name,
                        AlternateAddresses {
                            hostname: alt.hostname,
                            ports: named_ports(&alt.ports),
                        },
                    )
                })
                .collect(),
        })
        .collect();

    let partitions = raw
        .vbucket_server_map
        .map(|m| PartitionMap::new(m.vbucket_map))
        .unwrap_or_default();

    Ok(ClusterConfig {
        version: ConfigVersion::new(raw.rev_epoch, raw.rev),
        nodes,
        partitions,
        cluster_capabilities: Capabilities::from_names(raw.cluster_capabilities),
        bucket_capabilities: Capabilities::from_names(raw.bucket_capabilities),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "rev": 7,
        "revEpoch": 1,
        "nodesExt": [
            {
                "hostname": "10.0.0.1",
                "services": {"kv": 11210, "mgmt": 8091},
                "alternateAddresses": {
                    "external": {"hostname": "node1.example.com", "ports": {"kv": 31000}}
                }
            }
        ],
        "vBucketServerMap": {"vBucketMap": [[0, 1], [0, 1]]},
        "clusterCapabilities": ["collections"],
        "bucketCapabilities": ["durableWrite"]
    }"#;

    #[test]
    fn decodes_nodes_partitions_and_capabilities() {
        let config = decode_cluster_config(SAMPLE.as_bytes()).unwrap();
        assert_eq!(config.version, ConfigVersion::new(1, 7));
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].port(NodePort::Kv, "default"), Some(11210));
        assert_eq!(config.nodes[0].port(NodePort::Kv, "external"), Some(31000));
        assert_eq!(config.partitions.active(0), Some(0));
        assert!(config.cluster_capabilities.has(fathom_core::model::capability_bits::COLLECTIONS));
        assert!(config.bucket_capabilities.has(fathom_core::model::capability_bits::DURABLE_WRITE));
    }

    #[test]
    fn malformed_json_is_an_error_not_a_panic() {
        assert!(decode_cluster_config(b"not json").is_err());
    }
}
