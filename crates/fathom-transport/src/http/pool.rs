//! Six independent per-service HTTP pools: query, analytics, search,
//! views, management, and analytics-with-priority.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::http::session::{HttpError, HttpSession};
use crate::tls::TlsConfig;

/// How long a checked-in session may sit idle before `check_out` treats
/// it as stale and opens a fresh connection instead of reusing it.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct IdleEntry {
    session: HttpSession,
    checked_in_at: Instant,
}

impl IdleEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.checked_in_at) >= IDLE_TIMEOUT
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceFamily {
    Query,
    Analytics,
    AnalyticsPriority,
    Search,
    Views,
    Management,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no reachable node hosts {0:?}")]
    NoReachableNode(ServiceFamily),
    #[error(transparent)]
    Session(#[from] HttpError),
}

/// One pool per [`ServiceFamily`], each holding idle sessions keyed by
/// the node address they're connected to. `check_out` reuses an idle
/// session if one exists; otherwise it bootstraps a new one against the
/// next round-robin node advertising that service.
pub struct HttpPool {
    idle: Mutex<HashMap<ServiceFamily, Vec<IdleEntry>>>,
    nodes_by_family: Mutex<HashMap<ServiceFamily, Vec<SocketAddr>>>,
    cursor: Mutex<HashMap<ServiceFamily, usize>>,
    tls: Option<TlsConfig>,
}

impl HttpPool {
    pub fn new(tls: Option<TlsConfig>) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            nodes_by_family: Mutex::new(HashMap::new()),
            cursor: Mutex::new(HashMap::new()),
            tls,
        }
    }

    pub fn set_nodes(&self, family: ServiceFamily, nodes: Vec<SocketAddr>) {
        self.nodes_by_family.lock().expect("poisoned").insert(family, nodes);
    }

    pub async fn check_out(&self, family: ServiceFamily) -> Result<HttpSession, PoolError> {
        if let Some(session) = self.take_idle(family) {
            return Ok(session);
        }

        let addr = self.next_node(family).ok_or(PoolError::NoReachableNode(family))?;
        let host = addr.ip().to_string();
        let session = HttpSession::connect(addr, host, self.tls.as_ref()).await?;
        Ok(session)
    }

    pub fn check_in(&self, family: ServiceFamily, session: HttpSession) {
        self.idle.lock().expect("poisoned").entry(family).or_default().push(IdleEntry {
            session,
            checked_in_at: Instant::now(),
        });
    }

    /// Reuses a non-expired idle session, reaping every expired one it
    /// passes over so a quiet pool doesn't accumulate dead entries.
    fn take_idle(&self, family: ServiceFamily) -> Option<HttpSession> {
        let mut idle = self.idle.lock().expect("poisoned");
        let entries = idle.get_mut(&family)?;
        let now = Instant::now();
        entries.retain(|entry| !entry.is_expired(now));
        entries
            .iter()
            .position(|entry| entry.session.is_idle())
            .map(|i| entries.remove(i).session)
    }

    fn next_node(&self, family: ServiceFamily) -> Option<SocketAddr> {
        let nodes_by_family = self.nodes_by_family.lock().expect("poisoned");
        let nodes = nodes_by_family.get(&family)?;
        if nodes.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock().expect("poisoned");
        let index = cursor.entry(family).or_insert(0);
        let addr = nodes[*index % nodes.len()];
        *index = (*index + 1) % nodes.len();
        Some(addr)
    }
}

impl Default for HttpPool {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_every_node() {
        let pool = HttpPool::new(None);
        let nodes = vec![
            "127.0.0.1:8093".parse().unwrap(),
            "127.0.0.1:8094".parse().unwrap(),
        ];
        pool.set_nodes(ServiceFamily::Query, nodes.clone());
        let first = pool.next_node(ServiceFamily::Query).unwrap();
        let second = pool.next_node(ServiceFamily::Query).unwrap();
        let third = pool.next_node(ServiceFamily::Query).unwrap();
        assert_eq!(first, nodes[0]);
        assert_eq!(second, nodes[1]);
        assert_eq!(third, nodes[0]);
    }

    #[test]
    fn no_nodes_registered_yields_none() {
        let pool = HttpPool::new(None);
        assert!(pool.next_node(ServiceFamily::Management).is_none());
    }

    #[test]
    fn expired_idle_entry_is_not_reused() {
        let entry = IdleEntry {
            session: HttpSession::from_queue_for_test(),
            checked_in_at: Instant::now() - IDLE_TIMEOUT - Duration::from_secs(1),
        };
        assert!(entry.is_expired(Instant::now()));
    }

    #[test]
    fn fresh_idle_entry_has_not_expired() {
        let entry = IdleEntry {
            session: HttpSession::from_queue_for_test(),
            checked_in_at: Instant::now(),
        };
        assert!(!entry.is_expired(Instant::now()));
    }
}
