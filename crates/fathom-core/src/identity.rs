//! The identity this client presents to every server it talks to: a
//! stable user-agent string for HELLO/HTTP, and a per-request
//! correlation id for diagnosing a single call across client and server
//! logs.

use std::sync::atomic::{AtomicU64, Ordering};

pub const SDK_NAME: &str = "fathom-rust";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `"fathom-rust/0.1.0"`, sent as the HELLO key and the HTTP `User-Agent`
/// header on every request.
pub fn user_agent() -> String {
    format!("{SDK_NAME}/{SDK_VERSION}")
}

static CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A correlation id unique within this process, attached to every HTTP
/// request as `client-context-id` so a server-side log line can be
/// traced back to the call that produced it.
pub fn next_client_context_id() -> String {
    let n = CONTEXT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{SDK_NAME}/{n:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_names_the_sdk() {
        assert!(user_agent().starts_with("fathom-rust/"));
    }

    #[test]
    fn context_ids_are_unique_and_increasing() {
        let a = next_client_context_id();
        let b = next_client_context_id();
        assert_ne!(a, b);
    }
}
