//! Platform-specific process primitives.
//!
//! Signal delivery, liveness checks and forced termination. Everything here
//! works on raw PIDs and never assumes the process is our child, although it
//! reaps children opportunistically so they do not linger as zombies.

use crate::config::SupervisionConfig;
use crate::error::{ProcwardError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::thread::sleep;
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Convert a PID into a `nix` PID, rejecting values `kill(2)` would treat as
/// process groups or broadcasts.
fn to_nix_pid(pid: u32) -> Option<Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(Pid::from_raw(pid as i32))
}

/// Check whether the process table reports the process as a zombie.
pub fn is_zombie(pid: u32) -> bool {
    let sys_pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::new(),
    );
    system
        .process(sys_pid)
        .is_some_and(|process| process.status() == ProcessStatus::Zombie)
}

/// Check if a process with the given PID is alive.
///
/// Uses `kill(pid, 0)`; a process we lack permission to signal still counts as
/// alive. Zombies count as dead.
pub fn is_process_alive(pid: u32) -> bool {
    let Some(nix_pid) = to_nix_pid(pid) else {
        return false;
    };

    match kill(nix_pid, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// Deliver a signal to a single process.
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let nix_pid = to_nix_pid(pid).ok_or(ProcwardError::Signal {
        pid,
        errno: Errno::ESRCH,
    })?;
    debug!("Sending {} to process {}", signal, pid);
    kill(nix_pid, signal).map_err(|errno| ProcwardError::Signal { pid, errno })
}

/// Reap the process if it is an exited child of ours.
pub fn reap(pid: u32) {
    let Some(nix_pid) = to_nix_pid(pid) else {
        return;
    };
    match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => debug!("waitpid({}) -> {:?}", pid, status),
        // ECHILD means we're not the parent - that's fine, init will reap it
        Err(Errno::ECHILD) => {}
        Err(e) => debug!("waitpid({}) failed: {}", pid, e),
    }
}

/// Wait until the process exits or `timeout` elapses.
///
/// Returns `true` if the process is gone.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        reap(pid);
        if !is_process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(SupervisionConfig::SHUTDOWN_POLL_INTERVAL);
    }
}

/// Send `signal`, wait up to `timeout` for the process to exit, then SIGKILL.
///
/// # Returns
/// `true` if the process was terminated (or wasn't running).
pub fn terminate_process(pid: u32, signal: Signal, timeout: Duration) -> Result<bool> {
    if !is_process_alive(pid) {
        debug!("Process {} is not running", pid);
        reap(pid);
        return Ok(true);
    }

    match send_signal(pid, signal) {
        Ok(()) => {}
        Err(ProcwardError::Signal {
            errno: Errno::ESRCH,
            ..
        }) => return Ok(true),
        Err(e) => warn!("{}", e),
    }

    if wait_for_exit(pid, timeout) {
        debug!("Process {} terminated after {}", pid, signal);
        return Ok(true);
    }

    force_kill(pid)
}

/// SIGKILL a process and reap it.
pub fn force_kill(pid: u32) -> Result<bool> {
    debug!("Process {} still running, sending SIGKILL", pid);
    match send_signal(pid, Signal::SIGKILL) {
        Ok(()) => {}
        Err(ProcwardError::Signal {
            errno: Errno::ESRCH,
            ..
        }) => return Ok(true),
        Err(e) => return Err(e),
    }

    Ok(wait_for_exit(pid, SupervisionConfig::SHUTDOWN_WAIT))
}
