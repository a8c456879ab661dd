//! The one-shot timer collaborator behind transfer retries.

use std::time::Instant;

pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// A one-shot timer.
///
/// `invoke_at` replaces any previously armed callback. Cancellation is
/// asynchronous: a callback may still fire once after `cancel` returns, and
/// also after a re-arm races with an in-flight expiry. Callers guard against
/// stale firings themselves (the transfer client stamps each arm with an
/// epoch), so implementations do not need to provide that guarantee.
///
/// `invoke_at` may be called while the caller holds its own locks;
/// implementations must not run the callback synchronously from inside it.
pub trait RetryTimer: Send + Sync {
    fn invoke_at(&self, deadline: Instant, callback: TimerCallback);
    fn cancel(&self);
}
