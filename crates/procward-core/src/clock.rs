//! Time source abstraction.
//!
//! The supervisor measures intervals with the monotonic clock and stamps
//! status snapshots with wall-clock time.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Instant;

/// Monotonic and wall-clock time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic instant, used for grace periods and elapsed-time checks.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for reporting.
    fn wall(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
