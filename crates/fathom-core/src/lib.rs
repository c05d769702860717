//! Shared contracts for the fathom client: the data model, the error
//! taxonomy, cancellation/deadline primitives, and the retry decision
//! table. Transport- and codec-specific crates depend on this one; it
//! depends on nothing transport-specific itself.

pub mod config;
pub mod contract;
pub mod error;
pub mod identity;
pub mod ids;
pub mod model;
pub mod retry;
pub mod status;

pub use contract::{Cancellation, Deadline};
pub use error::{ClientError, ErrorCategory, RequestContext};
pub use identity::{next_client_context_id, user_agent};
pub use ids::Opaque;
pub use retry::{RetryDecision, RetryReason};
