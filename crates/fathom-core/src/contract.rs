//! Cancellation and deadline primitives shared by every pending operation.
//!
//! A [`Deadline`] is an absolute point in time; a [`Cancellation`] is an
//! out-of-band "stop now" signal that a session can raise for every
//! operation still in flight on it. The two are deliberately independent: a timeout expiring
//! does not imply the holder called `cancel()`, and vice versa, so a
//! pending operation checks both.
//!
//! ## Why
//! Every call that crosses the wire needs a way to be cut short from the
//! outside, independent of whatever per-call timeout it was given.
//! Threading a `tokio_util::sync::CancellationToken`-style flag through
//! every future call site is overkill here: the orchestrator only ever
//! needs a cheap, cloneable yes/no.
//!
//! ## How
//! `Cancellation` is one atomic bool behind an `Arc`; `child()` clones
//! the handle so a session can hand the same flag to every opaque table
//! entry it owns. `Deadline` wraps `Instant` rather than wall-clock time
//! so an NTP step can't shorten or extend an in-flight timeout.
//!
//! ## What
//! `cancel()` is idempotent and tells the caller whether it was the one
//! that tripped the flag. `Deadline::is_expired` and `remaining` are the
//! two queries the orchestrator's retry loop checks before every attempt.
//!
//! ## Trade-offs
//! Neither primitive notifies anyone; there is no callback or waker
//! registration. A held future must poll `is_cancelled`/`is_expired`
//! itself at whatever granularity its call site needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cooperative cancellation flag, shared by clone.
///
/// `cancel()` is idempotent: only the first caller gets `true` back, so a
/// session tearing down its whole opaque table doesn't double-report a
/// teardown that a per-operation timeout already triggered.
///
/// ## Why
/// A session tearing itself down needs to tell every in-flight operation
/// to stop, without each one polling the session directly.
///
/// ## How
/// One [`AtomicBool`] behind an `Arc`; `child()` clones the `Arc` so every
/// holder observes the same flag.
///
/// ## What
/// `cancel()` returns `true` exactly once, to the caller that flipped the
/// bit from unset to set.
#[derive(Clone, Debug)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Marks this token cancelled. Returns `true` the first time, `false`
    /// on every subsequent call.
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// A second handle onto the same flag, for fanning the signal out to
    /// every pending operation a session owns.
    pub fn child(&self) -> Self {
        self.clone()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// An absolute expiry point, or none for "no deadline set".
///
/// Built from [`Instant`] rather than wall-clock time so that NTP
/// adjustments can't shorten or lengthen an in-flight timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub const fn none() -> Self {
        Self { at: None }
    }

    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// `true` once `now` has passed the deadline; a deadline of `none()`
    /// never expires.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.at, Some(at) if now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time remaining, or `None` if already expired or unset.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.and_then(|at| at.checked_duration_since(Instant::now()))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

/// Bundles the two cross-cutting signals every pending operation and
/// every session-wide teardown need to check.
#[derive(Clone, Debug)]
pub struct CallContext {
    deadline: Deadline,
    cancellation: Cancellation,
}

impl CallContext {
    pub fn new(deadline: Deadline) -> Self {
        Self {
            deadline,
            cancellation: Cancellation::new(),
        }
    }

    pub fn with_cancellation(deadline: Deadline, cancellation: Cancellation) -> Self {
        Self {
            deadline,
            cancellation,
        }
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn is_live(&self) -> bool {
        !self.deadline.is_expired() && !self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent_for_the_first_caller_only() {
        let token = Cancellation::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(token.is_cancelled());
        assert!(!token.cancel());
    }

    #[test]
    fn child_shares_state_with_parent() {
        let parent = Cancellation::new();
        let child = parent.child();
        child.cancel();
        assert!(parent.is_cancelled());
    }

    #[test]
    fn deadline_none_never_expires() {
        let deadline = Deadline::none();
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().is_none());
    }

    #[test]
    fn deadline_after_zero_is_immediately_expired() {
        let deadline = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(1));
        assert!(deadline.is_expired());
    }
}
