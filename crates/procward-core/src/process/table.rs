//! Process table scanning.
//!
//! Answers "does a process named X exist, with what PID and resource usage?"
//! without requiring that we spawned it, so a supervisor can attach to a
//! process that was already running.
//!
//! # Name matching
//!
//! The kernel truncates the reported command name (15 bytes on Linux), so a
//! process matches when its *reported* name is a prefix of the *expected*
//! name. Two services sharing a long common prefix can therefore match each
//! other's processes.

use crate::platform;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Resource usage of one process, sampled once per supervisor tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    /// Resident memory as a fraction of total system memory (0.0-1.0).
    pub memory_fraction: f64,
    /// CPU usage as a fraction of total CPU capacity (0.0-1.0).
    pub cpu_fraction: f64,
}

/// Check whether a reported process name matches the expected name.
pub fn name_matches(reported: &str, expected: &str) -> bool {
    !reported.is_empty() && expected.starts_with(reported)
}

/// Scanner over the OS process registry.
#[derive(Debug)]
pub struct ProcessTable {
    system: Mutex<System>,
    cpu_count: usize,
}

impl ProcessTable {
    /// Create a new process table reader.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            system: Mutex::new(system),
            cpu_count,
        }
    }

    fn lock(&self) -> MutexGuard<'_, System> {
        self.system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All live PIDs whose reported name matches `name`, lowest first.
    fn scan(&self, name: &str) -> Vec<u32> {
        let mut system = self.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new(),
        );

        let mut pids: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
            // Threads show up in the table on Linux; only count processes.
            .filter(|(_, process)| process.thread_kind().is_none())
            .filter(|(_, process)| name_matches(&process.name().to_string_lossy(), name))
            .map(|(pid, _)| pid.as_u32())
            .collect();

        pids.sort_unstable();
        pids
    }

    /// Count running processes matching `name`.
    pub fn count_instances(&self, name: &str) -> usize {
        self.scan(name).len()
    }

    /// Find the first (lowest) PID matching `name`.
    pub fn find_pid(&self, name: &str) -> Option<u32> {
        self.scan(name).into_iter().next()
    }

    /// Signal every process matching `name`.
    ///
    /// Does not wait for the processes to exit. Returns how many signals were
    /// delivered.
    pub fn kill_all(&self, name: &str, signal: nix::sys::signal::Signal) -> usize {
        let mut delivered = 0;
        for pid in self.scan(name) {
            match platform::send_signal(pid, signal) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("kill_all({}): {}", name, e),
            }
        }
        delivered
    }

    /// Check that a PID exists and is not a zombie.
    pub fn is_running(&self, pid: u32) -> bool {
        platform::is_process_alive(pid)
    }

    /// Name the process table reports for `pid`.
    pub fn name_of(&self, pid: u32) -> Option<String> {
        let mut system = self.lock();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new(),
        );
        system
            .process(sys_pid)
            .map(|process| process.name().to_string_lossy().into_owned())
    }

    /// Sample memory and CPU usage for `pid`.
    ///
    /// Returns a zeroed sample if the process is gone or unreadable. CPU usage
    /// is measured between consecutive samples of the same PID, so the first
    /// sample of a process always reports zero CPU.
    pub fn sample_resources(&self, pid: u32) -> ResourceSample {
        let mut system = self.lock();
        let sys_pid = Pid::from_u32(pid);

        system.refresh_memory();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );

        let Some(process) = system.process(sys_pid) else {
            debug!("sample_resources: process {} not readable", pid);
            return ResourceSample::default();
        };

        let total_memory = system.total_memory();
        let memory_fraction = if total_memory > 0 {
            process.memory() as f64 / total_memory as f64
        } else {
            0.0
        };
        let cpu_fraction = f64::from(process.cpu_usage()) / 100.0 / self.cpu_count as f64;

        ResourceSample {
            memory_fraction: memory_fraction.clamp(0.0, 1.0),
            cpu_fraction: cpu_fraction.clamp(0.0, 1.0),
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
