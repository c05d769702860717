//! The public submit API: connection bootstrap, key routing (C5), the
//! per-bucket/cluster session topology (C6), and the retry orchestrator
//! (C7) wired into real per-operation timers.

pub mod bucket;
pub mod cluster;
pub mod dns;
pub mod orchestrator;
pub mod submit;

pub use bucket::{Bucket, ReplicaSelector};
pub use cluster::{Cluster, NetworkSelection};
pub use orchestrator::{Orchestrator, OrchestratorOutcome};
pub use submit::{submit_http, submit_kv, KvOperation};
