//! Restart policy.
//!
//! Each tick the supervisor asks the policy what to do about a dead process or
//! a ceiling breach. Hit counts are consecutive: a clean sample resets them.

use crate::config::EscalationConfig;
use serde::Serialize;
use tracing::warn;

/// Outcome of a policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Normal,
    Restart,
    /// Wait one backoff interval, then restart.
    Backoff,
    /// Supervision failed. The loop stops and the process is left as it is.
    Shutdown,
    /// The loop stops without treating it as a failure.
    Unmonitor,
}

impl Action {
    /// Whether this action ends the supervisor loop.
    pub fn is_terminal(self) -> bool {
        matches!(self, Action::Shutdown | Action::Unmonitor)
    }
}

/// Policy hooks consulted by the supervisor.
///
/// Every hook defaults to [`Action::Restart`].
pub trait SupervisionPolicy: Send + Sync {
    /// The process was found dead on `hits` consecutive ticks.
    fn on_dead_process(&self, hits: u32) -> Action {
        let _ = hits;
        Action::Restart
    }

    /// Memory was above the ceiling on `hits` consecutive ticks.
    ///
    /// `value` is the sampled fraction of total system memory.
    fn on_memory_violation(&self, hits: u32, value: f64) -> Action {
        let _ = (hits, value);
        Action::Restart
    }

    /// CPU was above the ceiling on `hits` consecutive ticks.
    fn on_cpu_violation(&self, hits: u32, value: f64) -> Action {
        let _ = (hits, value);
        Action::Restart
    }
}

/// Restart on every failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl SupervisionPolicy for DefaultPolicy {}

/// Restart, then back off, then give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalatingPolicy {
    backoff_after: u32,
    give_up_after: Option<u32>,
    violation_tolerance: u32,
}

impl EscalatingPolicy {
    /// # Arguments
    ///
    /// * `backoff_after` - Dead hits from which restarts wait a backoff interval
    /// * `give_up_after` - Dead hits from which supervision stops
    /// * `violation_tolerance` - Violating samples tolerated before restarting
    pub fn new(backoff_after: u32, give_up_after: Option<u32>, violation_tolerance: u32) -> Self {
        Self {
            backoff_after,
            give_up_after,
            violation_tolerance,
        }
    }

    fn on_violation(&self, kind: &str, hits: u32, value: f64) -> Action {
        if hits <= self.violation_tolerance {
            warn!(
                "{} violation {} of {} tolerated (value {:.3})",
                kind, hits, self.violation_tolerance, value
            );
            return Action::Normal;
        }
        Action::Restart
    }
}

impl From<EscalationConfig> for EscalatingPolicy {
    fn from(config: EscalationConfig) -> Self {
        Self::new(
            config.backoff_after,
            config.give_up_after,
            config.violation_tolerance,
        )
    }
}

impl SupervisionPolicy for EscalatingPolicy {
    fn on_dead_process(&self, hits: u32) -> Action {
        if let Some(limit) = self.give_up_after {
            if hits >= limit {
                warn!("Process dead on {} consecutive checks; giving up", hits);
                return Action::Shutdown;
            }
        }
        if hits >= self.backoff_after {
            warn!("Process dead on {} consecutive checks; backing off", hits);
            return Action::Backoff;
        }
        Action::Restart
    }

    fn on_memory_violation(&self, hits: u32, value: f64) -> Action {
        self.on_violation("Memory", hits, value)
    }

    fn on_cpu_violation(&self, hits: u32, value: f64) -> Action {
        self.on_violation("CPU", hits, value)
    }
}
