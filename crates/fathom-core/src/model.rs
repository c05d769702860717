//! The cluster configuration snapshot and the values that travel
//! alongside key-value responses.

use std::collections::HashMap;

pub const DEFAULT_PARTITION_COUNT: usize = 1024;

/// `(rev_epoch, rev)` — strictly increasing, compared lexicographically.
/// A newer configuration supersedes an older one only if its version
/// pair is strictly greater.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfigVersion {
    pub rev_epoch: u64,
    pub rev: u64,
}

impl ConfigVersion {
    pub fn new(rev_epoch: u64, rev: u64) -> Self {
        Self { rev_epoch, rev }
    }
}

/// The named ports a node may expose, plain and TLS variants kept
/// distinct because a client picks one set at bootstrap and never mixes
/// them mid-connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodePort {
    Kv,
    KvTls,
    Mgmt,
    MgmtTls,
    Query,
    QueryTls,
    Analytics,
    AnalyticsTls,
    Search,
    SearchTls,
    Views,
    ViewsTls,
}

/// An alternate-network view of a node: the hostnames/ports the client
/// should use when talking to the cluster from outside its own network.
#[derive(Clone, Debug, Default)]
pub struct AlternateAddresses {
    pub hostname: String,
    pub ports: HashMap<NodePort, u16>,
}

#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    pub hostname: String,
    pub ports: HashMap<NodePort, u16>,
    pub alternate: HashMap<String, AlternateAddresses>,
}

impl NodeConfig {
    pub fn port(&self, port: NodePort, network: &str) -> Option<u16> {
        if network == "default" {
            self.ports.get(&port).copied()
        } else {
            self.alternate
                .get(network)
                .and_then(|alt| alt.ports.get(&port).copied())
        }
    }

    pub fn hostname(&self, network: &str) -> &str {
        if network == "default" {
            &self.hostname
        } else {
            self.alternate
                .get(network)
                .map(|alt| alt.hostname.as_str())
                .unwrap_or(&self.hostname)
        }
    }
}

/// A minimal capability bitset (design notes: "store this as a bitset,
/// not as many booleans"). Each capability occupies one bit; unknown
/// capabilities from a newer server round-trip harmlessly as an unset
/// bit on this client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities(u64);

/// Bit positions for the capability names a config JSON body can list.
/// An unrecognized name round-trips as a no-op rather than an error, so
/// a newer server can advertise capabilities this client doesn't know
/// about yet without breaking config adoption.
pub mod capability_bits {
    pub const COLLECTIONS: u8 = 0;
    pub const DURABLE_WRITE: u8 = 1;
    pub const CREATE_AS_DELETED: u8 = 2;
    pub const PREPARED_STATEMENTS: u8 = 3;
    pub const ENHANCED_PREPARED_STATEMENTS: u8 = 4;
    pub const RANGE_SCAN: u8 = 5;
    pub const SUBDOC_REPLICA_READ: u8 = 6;

    pub fn named(name: &str) -> Option<u8> {
        match name {
            "collections" => Some(COLLECTIONS),
            "durableWrite" => Some(DURABLE_WRITE),
            "createAsDeleted" => Some(CREATE_AS_DELETED),
            "preparedStatements" => Some(PREPARED_STATEMENTS),
            "enhancedPreparedStatements" => Some(ENHANCED_PREPARED_STATEMENTS),
            "rangeScan" => Some(RANGE_SCAN),
            "subdocReplicaRead" => Some(SUBDOC_REPLICA_READ),
            _ => None,
        }
    }
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);

    pub fn with(self, bit: u8) -> Self {
        Capabilities(self.0 | (1 << bit))
    }

    pub fn has(self, bit: u8) -> bool {
        (self.0 & (1 << bit)) != 0
    }

    pub fn union(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    /// Build a capability set from the names a config JSON body lists,
    /// e.g. `["collections", "durableWrite"]`. Unknown names are dropped
    /// rather than rejected; prepared-statement support is probed
    /// through this same set via
    /// `PREPARED_STATEMENTS`/`ENHANCED_PREPARED_STATEMENTS`.
    pub fn from_names<S: AsRef<str>>(names: impl IntoIterator<Item = S>) -> Self {
        names
            .into_iter()
            .filter_map(|name| capability_bits::named(name.as_ref()))
            .fold(Capabilities::NONE, Capabilities::with)
    }

    pub fn supports_prepared_statements(self) -> bool {
        self.has(capability_bits::PREPARED_STATEMENTS) || self.has(capability_bits::ENHANCED_PREPARED_STATEMENTS)
    }
}

/// `partition_map[partition] = [active, replica1, replica2, ...]`, node
/// indices into `ClusterConfig::nodes`. `-1` means "not yet assigned".
#[derive(Clone, Debug, Default)]
pub struct PartitionMap {
    rows: Vec<Vec<i32>>,
}

impl PartitionMap {
    pub fn new(rows: Vec<Vec<i32>>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn active(&self, partition: usize) -> Option<i32> {
        self.rows.get(partition).and_then(|row| row.first()).copied()
    }

    pub fn replica(&self, partition: usize, index: usize) -> Option<i32> {
        self.rows.get(partition).and_then(|row| row.get(index + 1)).copied()
    }

    pub fn replica_count(&self, partition: usize) -> usize {
        self.rows.get(partition).map(|row| row.len().saturating_sub(1)).unwrap_or(0)
    }
}

/// One cluster map snapshot. Immutable once built; a new configuration
/// always replaces this one wholesale rather than mutating it in place.
#[derive(Clone, Debug, Default)]
pub struct ClusterConfig {
    pub version: ConfigVersion,
    pub nodes: Vec<NodeConfig>,
    pub partitions: PartitionMap,
    pub cluster_capabilities: Capabilities,
    pub bucket_capabilities: Capabilities,
}

impl ClusterConfig {
    /// `true` if `self` is strictly newer than `current` and should
    /// replace it. Exactly one configuration is active per bucket at
    /// any moment.
    pub fn supersedes(&self, current: &ClusterConfig) -> bool {
        self.version > current.version
    }

    pub fn partition_count(&self) -> usize {
        if self.partitions.is_empty() {
            DEFAULT_PARTITION_COUNT
        } else {
            self.partitions.len()
        }
    }
}

/// Proof that a mutation reached a specific partition at a specific
/// sequence number, used for read-your-writes consistency on
/// non-key-value services.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutationToken {
    pub partition_id: u16,
    pub partition_uuid: u64,
    pub sequence_number: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_version_supersedes_older() {
        let older = ClusterConfig {
            version: ConfigVersion::new(1, 5),
            ..Default::default()
        };
        let newer = ClusterConfig {
            version: ConfigVersion::new(1, 6),
            ..Default::default()
        };
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
    }

    #[test]
    fn equal_version_does_not_supersede() {
        let a = ClusterConfig {
            version: ConfigVersion::new(2, 0),
            ..Default::default()
        };
        let b = a.clone();
        assert!(!a.supersedes(&b));
    }

    #[test]
    fn partition_map_exposes_replicas_after_active() {
        let map = PartitionMap::new(vec![vec![0, 1, 2]]);
        assert_eq!(map.active(0), Some(0));
        assert_eq!(map.replica(0, 0), Some(1));
        assert_eq!(map.replica(0, 1), Some(2));
        assert_eq!(map.replica_count(0), 2);
    }

    #[test]
    fn empty_cluster_config_falls_back_to_default_partition_count() {
        let config = ClusterConfig::default();
        assert_eq!(config.partition_count(), DEFAULT_PARTITION_COUNT);
    }

    #[test]
    fn capabilities_from_names_ignores_unknown_entries() {
        let caps = Capabilities::from_names(["collections", "somethingFuture", "enhancedPreparedStatements"]);
        assert!(caps.has(capability_bits::COLLECTIONS));
        assert!(caps.supports_prepared_statements());
        assert!(!caps.has(capability_bits::DURABLE_WRITE));
    }
}
