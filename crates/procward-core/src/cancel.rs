//! Unified cancellation token with interruptible waits.
//!
//! A single `CancellationToken` is observed by every wait a supervisor makes
//! (tick interval, backoff, initial grace, PID-file polling), so one `cancel()`
//! wakes all of them at once instead of each wait owning its own semaphore.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct TokenState {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

impl TokenState {
    fn lock(&self) -> MutexGuard<'_, bool> {
        // A poisoned flag is still a valid bool.
        self.cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A cancellation token for cooperative cancellation of background loops.
///
/// This token can be cloned and shared across threads. When `cancel()` is
/// called on any clone, all clones observe the cancellation and every thread
/// blocked in [`CancellationToken::wait_timeout`] wakes up.
///
/// # Example
///
/// ```
/// use procward_core::cancel::CancellationToken;
/// use std::time::Duration;
///
/// let token = CancellationToken::new();
/// let token_clone = token.clone();
///
/// token_clone.cancel();
/// assert!(token.is_cancelled());
/// // Returns immediately because the token is already cancelled.
/// assert!(token.wait_timeout(Duration::from_secs(60)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every waiter.
    pub fn cancel(&self) {
        let mut cancelled = self.state.lock();
        *cancelled = true;
        self.state.wakeup.notify_all();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.state.lock()
    }

    /// Reset the token for reuse.
    ///
    /// Use with caution - ensure no threads are still waiting on this token.
    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    /// Check cancellation and return an error if cancelled.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }

    /// Sleep for up to `timeout`, returning early if the token is cancelled.
    ///
    /// Returns `true` if the wait ended because of cancellation and `false`
    /// if the full timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.state.lock();

        // Loop over spurious wakeups until cancelled or past the deadline.
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = match self.state.wakeup.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        true
    }
}

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::ProcwardError {
    fn from(err: CancelledError) -> Self {
        crate::error::ProcwardError::Other(err.to_string())
    }
}
