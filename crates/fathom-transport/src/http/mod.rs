//! The HTTP session & pool (C4): one independent pool per service
//! family over a hand-rolled streaming HTTP/1.1 encoder and a
//! `httparse`-based header decoder. This crate owns the wire framing
//! only — response bodies are handed back as opaque bytes.

pub mod pool;
pub mod session;

pub use pool::{HttpPool, ServiceFamily};
pub use session::{HttpRequest, HttpResponse, HttpSession};
