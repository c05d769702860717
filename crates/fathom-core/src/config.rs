//! Connection string parsing and cluster-wide options (C1). The grammar is
//! `scheme "://" node ("," node)* ("/" bucket)? ("?" kv ("&" kv)*)?`.

use std::collections::HashMap;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Couchbase,
    Couchbases,
    Http,
    Https,
}

impl Scheme {
    pub fn is_tls(self) -> bool {
        matches!(self, Scheme::Couchbases | Scheme::Https)
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Couchbase => 11210,
            Scheme::Couchbases => 11207,
            Scheme::Http => 8091,
            Scheme::Https => 18091,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "couchbase" => Some(Scheme::Couchbase),
            "couchbases" => Some(Scheme::Couchbases),
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            _ => None,
        }
    }
}

/// How bootstrap should proceed from one particular seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeMode {
    Cccp,
    Gcccp,
    Http,
    Mcd,
}

impl NodeMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cccp" => Some(NodeMode::Cccp),
            "gcccp" => Some(NodeMode::Gcccp),
            "http" => Some(NodeMode::Http),
            "mcd" => Some(NodeMode::Mcd),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedNode {
    pub host: String,
    pub port: Option<u16>,
    pub mode: Option<NodeMode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkSelector {
    Default,
    External,
    Auto,
}

impl NetworkSelector {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "default" => Some(NetworkSelector::Default),
            "external" => Some(NetworkSelector::External),
            "auto" => Some(NetworkSelector::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionStringError {
    #[error("missing \"scheme://\" in connection string")]
    MissingScheme,
    #[error("unrecognized scheme: {0}")]
    UnknownScheme(String),
    #[error("no nodes listed in connection string")]
    NoNodes,
    #[error("invalid port for host {host}: {port}")]
    InvalidPort { host: String, port: String },
    #[error("malformed query parameter: {0}")]
    MalformedOption(String),
}

/// The parsed connection string. Parsing never panics; malformed input
/// is a non-fatal, inspectable error value instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionString {
    pub scheme: Scheme,
    pub seeds: Vec<SeedNode>,
    pub bucket: Option<String>,
    pub options: HashMap<String, String>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self, ConnectionStringError> {
        let (scheme_raw, rest) = input
            .split_once("://")
            .ok_or(ConnectionStringError::MissingScheme)?;
        let scheme = Scheme::parse(scheme_raw)
            .ok_or_else(|| ConnectionStringError::UnknownScheme(scheme_raw.to_string()))?;

        let (authority, remainder) = match rest.split_once(|c| c == '/' || c == '?') {
            Some((authority, _)) => {
                let split_at = authority.len();
                (authority, &rest[split_at..])
            }
            None => (rest, ""),
        };

        let seeds = parse_seeds(authority)?;
        if seeds.is_empty() {
            return Err(ConnectionStringError::NoNodes);
        }

        let (bucket, query) = match remainder.strip_prefix('/') {
            Some(after_slash) => match after_slash.split_once('?') {
                Some((bucket, query)) => (non_empty(bucket), query),
                None => (non_empty(after_slash), ""),
            },
            None => (None, remainder.strip_prefix('?').unwrap_or("")),
        };

        let options = parse_options(query)?;

        Ok(Self {
            scheme,
            seeds,
            bucket,
            options,
        })
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|v| v.as_str())
    }

    pub fn bool_option(&self, key: &str, default: bool) -> bool {
        match self.option(key) {
            Some("true") => true,
            Some("false") => false,
            _ => default,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_seeds(authority: &str) -> Result<Vec<SeedNode>, ConnectionStringError> {
    authority
        .split(',')
        .filter(|s| !s.is_empty())
        .map(parse_one_seed)
        .collect()
}

fn parse_one_seed(raw: &str) -> Result<SeedNode, ConnectionStringError> {
    let (host_port, mode) = match raw.rsplit_once('=') {
        Some((left, mode_raw)) if NodeMode::parse(mode_raw).is_some() => {
            (left, NodeMode::parse(mode_raw))
        }
        _ => (raw, None),
    };

    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port_raw)) => {
            let port = port_raw.parse::<u16>().map_err(|_| ConnectionStringError::InvalidPort {
                host: host.to_string(),
                port: port_raw.to_string(),
            })?;
            (host.to_string(), Some(port))
        }
        None => (host_port.to_string(), None),
    };

    Ok(SeedNode { host, port, mode })
}

fn parse_options(query: &str) -> Result<HashMap<String, String>, ConnectionStringError> {
    let mut options = HashMap::new();
    if query.is_empty() {
        return Ok(options);
    }
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ConnectionStringError::MalformedOption(pair.to_string()))?;
        let decoded_value = percent_decode_str(value)
            .decode_utf8()
            .map_err(|_| ConnectionStringError::MalformedOption(pair.to_string()))?
            .into_owned();
        options.insert(key.to_string(), decoded_value);
    }
    Ok(options)
}

/// A round-robin cursor over the seed list. Exhaustion is observable and
/// requires an explicit `restart()` rather than silently wrapping forever.
#[derive(Clone, Debug)]
pub struct Origin {
    seeds: Vec<SeedNode>,
    cursor: usize,
    exhausted: bool,
}

impl Origin {
    pub fn new(seeds: Vec<SeedNode>) -> Self {
        Self {
            seeds,
            cursor: 0,
            exhausted: false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn restart(&mut self) {
        self.cursor = 0;
        self.exhausted = false;
    }

    pub fn next(&mut self) -> Option<&SeedNode> {
        if self.seeds.is_empty() || self.cursor >= self.seeds.len() {
            self.exhausted = true;
            return None;
        }
        let seed = &self.seeds[self.cursor];
        self.cursor += 1;
        Some(seed)
    }
}

/// Per-service default timeouts.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutProfile {
    pub connect: Duration,
    pub kv: Duration,
    pub query: Duration,
    pub analytics: Duration,
    pub search: Duration,
    pub views: Duration,
    pub management: Duration,
}

impl Default for TimeoutProfile {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            kv: Duration::from_secs(2),
            query: Duration::from_secs(75),
            analytics: Duration::from_secs(75),
            search: Duration::from_secs(75),
            views: Duration::from_secs(75),
            management: Duration::from_secs(75),
        }
    }
}

/// SASL credentials for the key-value handshake. `Debug` never prints
/// `password`, so a stray `{:?}` in a log line can't leak it.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The resolved, programmatic form of a connection string plus any
/// overrides.
#[derive(Clone, Debug)]
pub struct ClusterOptions {
    pub tls: bool,
    pub enable_dns_srv: bool,
    pub network: NetworkSelector,
    pub trust_certificate_path: Option<String>,
    pub timeouts: TimeoutProfile,
    pub show_queries_in_log: bool,
}

impl ClusterOptions {
    pub fn from_connection_string(cs: &ConnectionString) -> Self {
        Self {
            tls: cs.scheme.is_tls(),
            enable_dns_srv: cs.bool_option("enable_dns_srv", true),
            network: cs
                .option("network")
                .and_then(NetworkSelector::parse)
                .unwrap_or(NetworkSelector::Auto),
            trust_certificate_path: cs.option("trust_certificate").map(str::to_string),
            timeouts: TimeoutProfile::default(),
            show_queries_in_log: cs.bool_option("show_queries", false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_seeds_bucket_and_options() {
        let cs = ConnectionString::parse("couchbase://a,b:11211=mcd/travel-sample?network=external")
            .unwrap();
        assert_eq!(cs.scheme, Scheme::Couchbase);
        assert_eq!(
            cs.seeds,
            vec![
                SeedNode {
                    host: "a".into(),
                    port: None,
                    mode: None
                },
                SeedNode {
                    host: "b".into(),
                    port: Some(11211),
                    mode: Some(NodeMode::Mcd)
                },
            ]
        );
        assert_eq!(cs.bucket.as_deref(), Some("travel-sample"));
        assert_eq!(cs.option("network"), Some("external"));
    }

    #[test]
    fn missing_scheme_is_a_parse_error_not_a_panic() {
        assert_eq!(
            ConnectionString::parse("a,b,c"),
            Err(ConnectionStringError::MissingScheme)
        );
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(matches!(
            ConnectionString::parse("ftp://a"),
            Err(ConnectionStringError::UnknownScheme(_))
        ));
    }

    #[test]
    fn couchbases_implies_tls() {
        let cs = ConnectionString::parse("couchbases://a").unwrap();
        assert!(cs.scheme.is_tls());
    }

    #[test]
    fn origin_round_robins_then_reports_exhaustion() {
        let mut origin = Origin::new(vec![
            SeedNode { host: "a".into(), port: None, mode: None },
            SeedNode { host: "b".into(), port: None, mode: None },
        ]);
        assert_eq!(origin.next().unwrap().host, "a");
        assert_eq!(origin.next().unwrap().host, "b");
        assert!(origin.next().is_none());
        assert!(origin.is_exhausted());
        origin.restart();
        assert!(!origin.is_exhausted());
        assert_eq!(origin.next().unwrap().host, "a");
    }
}
