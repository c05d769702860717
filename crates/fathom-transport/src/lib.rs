//! Concrete tokio transports: the key-value session (C3) and the HTTP
//! service pool (C4).

pub mod http;
pub mod kv;
pub mod scram;
pub mod state;
pub mod stream;
pub mod tls;

pub use http::{HttpPool, HttpSession, ServiceFamily};
pub use kv::session::KvSession;
pub use state::SessionState;
pub use tls::TlsConfig;
