//! Consecutive-hit counters and the per-tick decision.

use super::options::SupervisorOptions;
use super::policy::{Action, SupervisionPolicy};
use crate::process::ResourceSample;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

/// Counter values at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub dead: u32,
    pub memory: u32,
    pub cpu: u32,
}

/// Per-kind consecutive-hit counters.
///
/// Written by the supervisor thread, readable from any thread.
#[derive(Debug, Default)]
pub struct ViolationCounters {
    dead: AtomicU32,
    memory: AtomicU32,
    cpu: AtomicU32,
}

fn hit(counter: &AtomicU32) -> u32 {
    counter.fetch_add(1, Ordering::SeqCst).saturating_add(1)
}

fn clear(counter: &AtomicU32) {
    counter.store(0, Ordering::SeqCst);
}

impl ViolationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            dead: self.dead.load(Ordering::SeqCst),
            memory: self.memory.load(Ordering::SeqCst),
            cpu: self.cpu.load(Ordering::SeqCst),
        }
    }

    pub fn reset(&self) {
        clear(&self.dead);
        clear(&self.memory);
        clear(&self.cpu);
    }

    /// Update the counters from one probe result and decide what to do.
    ///
    /// `sample` is `None` when the process is dead. Checks run dead, then
    /// memory, then CPU; when several fire the last one decides.
    pub fn evaluate(
        &self,
        sample: Option<ResourceSample>,
        options: &SupervisorOptions,
        policy: &dyn SupervisionPolicy,
    ) -> Action {
        let Some(sample) = sample else {
            let hits = hit(&self.dead);
            warn!("Process is not running (consecutive: {})", hits);
            return policy.on_dead_process(hits);
        };

        clear(&self.dead);
        let mut action = Action::Normal;

        match options.memory_ceiling() {
            Some(ceiling) if sample.memory_fraction > ceiling => {
                let hits = hit(&self.memory);
                warn!(
                    "Memory {:.3} above ceiling {:.3} (consecutive: {})",
                    sample.memory_fraction, ceiling, hits
                );
                action = policy.on_memory_violation(hits, sample.memory_fraction);
            }
            _ => clear(&self.memory),
        }

        match options.cpu_ceiling() {
            Some(ceiling) if sample.cpu_fraction > ceiling => {
                let hits = hit(&self.cpu);
                warn!(
                    "CPU {:.3} above ceiling {:.3} (consecutive: {})",
                    sample.cpu_fraction, ceiling, hits
                );
                action = policy.on_cpu_violation(hits, sample.cpu_fraction);
            }
            _ => clear(&self.cpu),
        }

        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every hit count it is shown.
    #[derive(Default)]
    struct RecordingPolicy {
        memory_hits: Mutex<Vec<u32>>,
        dead_hits: Mutex<Vec<u32>>,
    }

    impl SupervisionPolicy for RecordingPolicy {
        fn on_dead_process(&self, hits: u32) -> Action {
            self.dead_hits.lock().unwrap().push(hits);
            Action::Normal
        }

        fn on_memory_violation(&self, hits: u32, _value: f64) -> Action {
            self.memory_hits.lock().unwrap().push(hits);
            Action::Normal
        }

        fn on_cpu_violation(&self, _hits: u32, _value: f64) -> Action {
            Action::Backoff
        }
    }

    fn sample(memory: f64, cpu: f64) -> Option<ResourceSample> {
        Some(ResourceSample {
            memory_fraction: memory,
            cpu_fraction: cpu,
        })
    }

    #[test]
    fn test_counters_reset_on_recovery() {
        let counters = ViolationCounters::new();
        let options = SupervisorOptions::default().with_memory_ceiling(0.5);
        let policy = RecordingPolicy::default();

        for _ in 0..4 {
            counters.evaluate(sample(0.9, 0.0), &options, &policy);
        }
        assert_eq!(counters.snapshot().memory, 4);

        counters.evaluate(sample(0.1, 0.0), &options, &policy);
        assert_eq!(counters.snapshot().memory, 0);

        counters.evaluate(sample(0.9, 0.0), &options, &policy);
        assert_eq!(*policy.memory_hits.lock().unwrap(), vec![1, 2, 3, 4, 1]);
    }

    #[test]
    fn test_dead_hits_are_consecutive() {
        let counters = ViolationCounters::new();
        let options = SupervisorOptions::default();
        let policy = RecordingPolicy::default();

        counters.evaluate(None, &options, &policy);
        counters.evaluate(None, &options, &policy);
        counters.evaluate(sample(0.0, 0.0), &options, &policy);
        counters.evaluate(None, &options, &policy);

        assert_eq!(*policy.dead_hits.lock().unwrap(), vec![1, 2, 1]);
    }

    #[test]
    fn test_no_ceiling_never_violates() {
        let counters = ViolationCounters::new();
        let options = SupervisorOptions::default();
        let action = counters.evaluate(sample(1.0, 1.0), &options, &RecordingPolicy::default());
        assert_eq!(action, Action::Normal);
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_cpu_decision_overrides_memory() {
        let counters = ViolationCounters::new();
        let options = SupervisorOptions::default()
            .with_memory_ceiling(0.5)
            .with_cpu_ceiling(0.5);
        let action = counters.evaluate(sample(0.9, 0.9), &options, &RecordingPolicy::default());
        assert_eq!(action, Action::Backoff);
        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                dead: 0,
                memory: 1,
                cpu: 1
            }
        );
    }

    #[test]
    fn test_default_policy_restarts_dead_process() {
        let counters = ViolationCounters::new();
        let action = counters.evaluate(
            None,
            &SupervisorOptions::default(),
            &super::super::policy::DefaultPolicy,
        );
        assert_eq!(action, Action::Restart);
        counters.reset();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }
}
