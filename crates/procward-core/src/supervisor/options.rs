//! Supervisor timing and resource ceilings.

use crate::config::SupervisionConfig;
use std::time::Duration;

/// How often to check a process and when to call it unhealthy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorOptions {
    tick_interval: Duration,
    /// `None` means a multiple of the tick interval.
    backoff_interval: Option<Duration>,
    initial_grace: Duration,
    memory_ceiling: Option<f64>,
    cpu_ceiling: Option<f64>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            tick_interval: SupervisionConfig::TICK_INTERVAL,
            backoff_interval: None,
            initial_grace: SupervisionConfig::INITIAL_GRACE,
            memory_ceiling: None,
            cpu_ceiling: None,
        }
    }
}

impl SupervisorOptions {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_backoff_interval(mut self, interval: Duration) -> Self {
        self.backoff_interval = Some(interval);
        self
    }

    /// Checks are suppressed for this long after every start.
    pub fn with_initial_grace(mut self, grace: Duration) -> Self {
        self.initial_grace = grace;
        self
    }

    /// Restart when resident memory exceeds this fraction of system memory.
    pub fn with_memory_ceiling(mut self, fraction: f64) -> Self {
        self.memory_ceiling = Some(fraction);
        self
    }

    /// Restart when CPU usage exceeds this fraction of total CPU capacity.
    pub fn with_cpu_ceiling(mut self, fraction: f64) -> Self {
        self.cpu_ceiling = Some(fraction);
        self
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn backoff_interval(&self) -> Duration {
        self.backoff_interval
            .unwrap_or(self.tick_interval * SupervisionConfig::BACKOFF_MULTIPLIER)
    }

    pub fn initial_grace(&self) -> Duration {
        self.initial_grace
    }

    pub fn memory_ceiling(&self) -> Option<f64> {
        self.memory_ceiling
    }

    pub fn cpu_ceiling(&self) -> Option<f64> {
        self.cpu_ceiling
    }
}
