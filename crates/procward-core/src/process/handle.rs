//! Lifecycle of one supervised program instance.
//!
//! ```text
//! Unstarted -> Starting -> Running -> Dead | Stopping -> Stopped
//! ```
//!
//! `execute()` is accepted from `Unstarted`, `Dead` and `Stopped`; a restart
//! produces a fresh `Running` state. Dropping a handle leaves the process
//! running.

use super::descriptor::{tokenize, PidFile, PidFileOwner, ProcessDescriptor};
use super::table::{name_matches, ProcessTable, ResourceSample};
use crate::cancel::CancellationToken;
use crate::config::{PidFileConfig, SupervisionConfig};
use crate::context::RuntimeContext;
use crate::error::{ProcwardError, Result};
use crate::platform;
use nix::sys::signal::Signal;
use serde::Serialize;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`ProcessHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Unstarted,
    Starting,
    Running,
    Dead,
    Stopping,
    Stopped,
}

#[derive(Debug)]
struct HandleState {
    state: ProcessState,
    /// Valid only while the process is believed alive.
    pid: Option<u32>,
    /// Set when we spawned the process ourselves.
    child: Option<Child>,
}

impl HandleState {
    /// Reap our child if it has exited. Returns its PID if so.
    fn reap_child(&mut self) -> Option<u32> {
        let child = self.child.as_mut()?;
        let child_pid = child.id();
        match child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => {
                debug!("Child {} exited: {}", child_pid, status);
                self.child = None;
                Some(child_pid)
            }
            // Already reaped elsewhere (ECHILD).
            Err(_) => {
                self.child = None;
                Some(child_pid)
            }
        }
    }

    /// Re-check liveness; a dead process clears the PID immediately.
    fn refresh(&mut self, name: &str) -> bool {
        let exited = self.reap_child();
        let Some(pid) = self.pid else {
            return false;
        };

        if exited != Some(pid) && platform::is_process_alive(pid) {
            return true;
        }

        if self.state == ProcessState::Running {
            warn!("{} (PID {}) is no longer running", name, pid);
            self.state = ProcessState::Dead;
        }
        self.pid = None;
        false
    }
}

/// Spawn `program` in its own process group with stdio detached.
fn spawn_detached(program: &str, args: &[&str]) -> Result<Child> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        // Terminal signals aimed at the supervisor skip the child.
        .process_group(0)
        .spawn()
        .map_err(|e| ProcwardError::Spawn {
            program: program.to_string(),
            message: e.to_string(),
        })
}

/// Owns the lifecycle of exactly one external program instance.
#[derive(Debug)]
pub struct ProcessHandle {
    descriptor: ProcessDescriptor,
    table: Arc<ProcessTable>,
    state: Mutex<HandleState>,
    pid_poll_retries: u32,
    pid_poll_interval: Duration,
    shutdown_wait: Duration,
}

impl ProcessHandle {
    /// Create a handle. Nothing is started until [`ProcessHandle::execute`].
    pub fn new(ctx: &RuntimeContext, descriptor: ProcessDescriptor) -> Self {
        Self {
            descriptor,
            table: ctx.process_table().clone(),
            state: Mutex::new(HandleState {
                state: ProcessState::Unstarted,
                pid: None,
                child: None,
            }),
            pid_poll_retries: PidFileConfig::POLL_RETRIES,
            pid_poll_interval: PidFileConfig::POLL_INTERVAL,
            shutdown_wait: SupervisionConfig::SHUTDOWN_WAIT,
        }
    }

    /// Set how often and how long PID files are polled.
    pub fn with_pid_poll(mut self, retries: u32, interval: Duration) -> Self {
        self.pid_poll_retries = retries.max(1);
        self.pid_poll_interval = interval;
        self
    }

    /// Set how long a signalled process gets before it is force-killed.
    pub fn with_shutdown_wait(mut self, wait: Duration) -> Self {
        self.shutdown_wait = wait;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn descriptor(&self) -> &ProcessDescriptor {
        &self.descriptor
    }

    /// Last known PID, without re-checking liveness.
    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn state(&self) -> ProcessState {
        self.lock().state
    }

    /// Start the program, or attach to an instance already running.
    ///
    /// Returns `false` if the startup command is empty, the handle is already
    /// active, or the program could not be started.
    pub fn execute(&self) -> bool {
        self.execute_cancellable(&CancellationToken::new())
    }

    /// [`ProcessHandle::execute`], with PID-file polling interruptible by `cancel`.
    pub fn execute_cancellable(&self, cancel: &CancellationToken) -> bool {
        let name = self.descriptor.name();
        let Some((program, args)) = tokenize(self.descriptor.startup_command()) else {
            let e = ProcwardError::InvalidCommand(self.descriptor.startup_command().to_string());
            error!("Cannot start {}: {}", name, e);
            return false;
        };

        let previous = {
            let mut state = self.lock();
            if matches!(
                state.state,
                ProcessState::Starting | ProcessState::Stopping
            ) {
                warn!("Cannot start {}: handle is {:?}", name, state.state);
                return false;
            }
            if state.refresh(name) {
                warn!("Cannot start {}: already running as PID {:?}", name, state.pid);
                return false;
            }
            let previous = state.state;
            state.state = ProcessState::Starting;
            previous
        };

        let started = self.start(program, &args, cancel);

        let mut state = self.lock();
        match started {
            Some((pid, child)) => {
                state.pid = Some(pid);
                state.child = child;
                state.state = ProcessState::Running;
                info!("{} running with PID {}", name, pid);
                true
            }
            None => {
                state.state = if previous == ProcessState::Unstarted {
                    ProcessState::Unstarted
                } else {
                    ProcessState::Dead
                };
                false
            }
        }
    }

    fn start(
        &self,
        program: &str,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Option<(u32, Option<Child>)> {
        let name = self.descriptor.name();

        if let Some(pid_file) = self.descriptor.pid_file() {
            if let Some(pid) = self.attach_existing(pid_file, cancel) {
                info!(
                    "Attached to running {} (PID {}) via {}",
                    name,
                    pid,
                    pid_file.path().display()
                );
                return Some((pid, None));
            }
            if cancel.is_cancelled() {
                return None;
            }
        }

        let spawned_at = SystemTime::now();
        let mut child = match spawn_detached(program, args) {
            Ok(child) => child,
            Err(e) => {
                error!("Cannot start {}: {}", name, e);
                return None;
            }
        };
        let child_pid = child.id();
        debug!("Spawned {} as PID {}", name, child_pid);

        let pid = match self.descriptor.pid_file() {
            None => child_pid,
            Some(pid_file) if pid_file.owner() == PidFileOwner::Supervisor => {
                if let Err(e) = pid_file.write(child_pid) {
                    warn!("Failed to write PID file: {}", e);
                }
                child_pid
            }
            Some(pid_file) => match self.await_pid_file(pid_file, spawned_at, &mut child, cancel) {
                Some(pid) => pid,
                None => {
                    warn!(
                        "{} did not write {}; stopping PID {}",
                        name,
                        pid_file.path().display(),
                        child_pid
                    );
                    if let Err(e) =
                        platform::terminate_process(child_pid, Signal::SIGTERM, self.shutdown_wait)
                    {
                        warn!("{}", e);
                    }
                    let _ = child.try_wait();
                    return None;
                }
            },
        };

        Some((pid, Some(child)))
    }

    /// Attach to a process recorded in an existing PID file.
    ///
    /// The PID must be alive and its reported name must match the descriptor.
    /// An unreadable file is polled in case it is being written right now.
    fn attach_existing(&self, pid_file: &PidFile, cancel: &CancellationToken) -> Option<u32> {
        for _ in 0..self.pid_poll_retries {
            match pid_file.read() {
                Some(pid) if self.owns_pid(pid) => return Some(pid),
                Some(pid) => {
                    debug!(
                        "Ignoring stale PID file {} (PID {})",
                        pid_file.path().display(),
                        pid
                    );
                    return None;
                }
                None if !pid_file.exists() => return None,
                None => {}
            }
            if cancel.wait_timeout(self.pid_poll_interval) {
                return None;
            }
        }
        None
    }

    fn owns_pid(&self, pid: u32) -> bool {
        self.table.is_running(pid)
            && self
                .table
                .name_of(pid)
                .map(|reported| name_matches(&reported, self.descriptor.name()))
                .unwrap_or(false)
    }

    /// Wait for a self-registering program to write a fresh PID file.
    fn await_pid_file(
        &self,
        pid_file: &PidFile,
        spawned_at: SystemTime,
        child: &mut Child,
        cancel: &CancellationToken,
    ) -> Option<u32> {
        for _ in 0..self.pid_poll_retries {
            if let Some(pid) = pid_file.read_fresh(spawned_at) {
                if platform::is_process_alive(pid) {
                    return Some(pid);
                }
            }
            // A program that already failed will never write it.
            if let Ok(Some(status)) = child.try_wait() {
                if !status.success() {
                    warn!("{} exited during startup: {}", self.descriptor.name(), status);
                    return None;
                }
            }
            if cancel.wait_timeout(self.pid_poll_interval) {
                debug!("PID file wait for {} cancelled", self.descriptor.name());
                return None;
            }
        }
        None
    }

    /// Stop the program.
    ///
    /// Runs the graceful shutdown command if one is configured, otherwise
    /// sends `signal`. Either way a process that outlives its grace period is
    /// force-killed. Returns `true` immediately, without signalling, if the
    /// process is not running.
    pub fn shut_down(&self, signal: Signal) -> bool {
        let name = self.descriptor.name();

        let pid = {
            let mut state = self.lock();
            if state.state == ProcessState::Stopping {
                warn!("{} is already stopping", name);
                return false;
            }
            if !state.refresh(name) {
                if state.state != ProcessState::Unstarted {
                    state.state = ProcessState::Stopped;
                }
                debug!("{} is not running; nothing to stop", name);
                return true;
            }
            let Some(pid) = state.pid else {
                return true;
            };
            state.state = ProcessState::Stopping;
            pid
        };

        info!("Stopping {} (PID {})", name, pid);
        let stopped = match self.descriptor.shutdown_command() {
            Some(command) => self.run_shutdown_command(command, pid),
            None => match platform::terminate_process(pid, signal, self.shutdown_wait) {
                Ok(stopped) => stopped,
                Err(e) => {
                    error!("Failed to stop {} (PID {}): {}", name, pid, e);
                    false
                }
            },
        };

        let mut state = self.lock();
        state.reap_child();
        if stopped {
            state.pid = None;
            state.child = None;
            state.state = ProcessState::Stopped;
            if let Some(pid_file) = self.descriptor.pid_file() {
                if pid_file.owner() == PidFileOwner::Supervisor {
                    if let Err(e) = pid_file.remove() {
                        warn!("Failed to remove PID file: {}", e);
                    }
                }
            }
            info!("{} (PID {}) stopped", name, pid);
        } else {
            state.state = ProcessState::Running;
            error!("{} (PID {}) did not stop", name, pid);
        }
        stopped
    }

    fn run_shutdown_command(&self, command: &str, pid: u32) -> bool {
        let name = self.descriptor.name();

        match tokenize(command) {
            Some((program, args)) => match Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .output()
            {
                // Output is read to completion and discarded.
                Ok(output) => debug!("Shutdown command for {} exited: {}", name, output.status),
                Err(e) => warn!("Failed to run shutdown command {:?}: {}", command, e),
            },
            None => warn!("Shutdown command for {} is empty", name),
        }

        let pid_file = self.descriptor.pid_file();
        for _ in 0..self.pid_poll_retries {
            platform::reap(pid);
            if !platform::is_process_alive(pid) {
                return true;
            }
            if let Some(pid_file) = pid_file {
                match pid_file.read() {
                    None => return true,
                    Some(current) if current != pid => return true,
                    Some(_) => {}
                }
            }
            sleep(self.pid_poll_interval);
        }

        warn!("{} (PID {}) outlived its shutdown command; killing", name, pid);
        match platform::force_kill(pid) {
            Ok(stopped) => stopped,
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    /// Stop with SIGTERM, then start again.
    pub fn restart(&self) -> bool {
        self.restart_cancellable(&CancellationToken::new())
    }

    /// [`ProcessHandle::restart`], with PID-file polling interruptible by `cancel`.
    pub fn restart_cancellable(&self, cancel: &CancellationToken) -> bool {
        info!("Restarting {}", self.descriptor.name());
        if !self.shut_down(Signal::SIGTERM) {
            return false;
        }
        self.execute_cancellable(cancel)
    }

    /// Per-tick health probe.
    ///
    /// Returns `None` if the process is dead, otherwise its resource usage.
    pub fn probe(&self) -> Option<ResourceSample> {
        let pid = {
            let mut state = self.lock();
            if !state.refresh(self.descriptor.name()) {
                return None;
            }
            state.pid?
        };
        Some(self.table.sample_resources(pid))
    }

    pub fn is_alive(&self) -> bool {
        self.lock().refresh(self.descriptor.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;
    use tempfile::TempDir;

    fn context() -> (TempDir, RuntimeContext) {
        let temp_dir = TempDir::new().unwrap();
        let ctx = RuntimeContext::new(temp_dir.path()).unwrap();
        (temp_dir, ctx)
    }

    fn sleeper(ctx: &RuntimeContext) -> ProcessHandle {
        ProcessHandle::new(ctx, ProcessDescriptor::new("sleep", "/bin/sleep 100"))
            .with_pid_poll(10, Duration::from_millis(50))
            .with_shutdown_wait(Duration::from_secs(2))
    }

    #[test]
    fn test_execute_sleep() {
        let (_dir, ctx) = context();
        let handle = sleeper(&ctx);
        assert_eq!(handle.state(), ProcessState::Unstarted);

        assert!(handle.execute());
        assert!(handle.is_alive());
        assert!(handle.pid().unwrap() > 0);
        assert_eq!(handle.state(), ProcessState::Running);

        assert!(handle.shut_down(Signal::SIGTERM));
    }

    #[test]
    fn test_execute_empty_command_fails() {
        let (_dir, ctx) = context();
        let handle = ProcessHandle::new(&ctx, ProcessDescriptor::new("nothing", "   "));
        assert!(!handle.execute());
        assert_eq!(handle.state(), ProcessState::Unstarted);
        assert_eq!(handle.pid(), None);
    }

    #[test]
    fn test_execute_missing_binary_fails() {
        let (_dir, ctx) = context();
        let handle = ProcessHandle::new(
            &ctx,
            ProcessDescriptor::new("ghost", "/nonexistent/procward/ghost --flag"),
        );
        assert!(!handle.execute());
        assert_eq!(handle.state(), ProcessState::Unstarted);
    }

    #[test]
    fn test_execute_twice_rejected() {
        let (_dir, ctx) = context();
        let handle = sleeper(&ctx);
        assert!(handle.execute());
        let pid = handle.pid();

        assert!(!handle.execute());
        assert_eq!(handle.pid(), pid);

        assert!(handle.shut_down(Signal::SIGTERM));
    }

    #[test]
    fn test_shut_down_is_idempotent() {
        let (_dir, ctx) = context();
        let handle = sleeper(&ctx);

        // Never started.
        assert!(handle.shut_down(Signal::SIGTERM));

        assert!(handle.execute());
        assert!(handle.shut_down(Signal::SIGTERM));
        assert_eq!(handle.state(), ProcessState::Stopped);

        let start = Instant::now();
        assert!(handle.shut_down(Signal::SIGTERM));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(handle.state(), ProcessState::Stopped);
    }

    #[test]
    fn test_restart_keeps_descriptor() {
        let (_dir, ctx) = context();
        let handle = sleeper(&ctx);
        assert!(handle.execute());
        let before = handle.pid().unwrap();

        assert!(handle.restart());
        assert!(handle.is_alive());
        // The OS may hand out the same PID again.
        let after = handle.pid().unwrap();
        assert!(after == before || !platform::is_process_alive(before));
        assert_eq!(handle.descriptor().name(), "sleep");
        assert_eq!(handle.descriptor().startup_command(), "/bin/sleep 100");

        assert!(handle.shut_down(Signal::SIGTERM));
    }

    #[test]
    fn test_dead_process_clears_pid() {
        let (_dir, ctx) = context();
        let handle = sleeper(&ctx);
        assert!(handle.execute());
        let pid = handle.pid().unwrap();

        platform::send_signal(pid, Signal::SIGKILL).unwrap();
        sleep(Duration::from_millis(100));

        assert!(handle.probe().is_none());
        assert_eq!(handle.pid(), None);
        assert_eq!(handle.state(), ProcessState::Dead);

        // Execute is accepted again from Dead.
        assert!(handle.execute());
        assert!(handle.shut_down(Signal::SIGTERM));
    }

    #[test]
    fn test_supervisor_owned_pid_file() {
        let (dir, ctx) = context();
        let pid_file = PidFile::new(dir.path().join("sleep.pid"), PidFileOwner::Supervisor);
        let handle = ProcessHandle::new(
            &ctx,
            ProcessDescriptor::new("sleep", "/bin/sleep 100").with_pid_file(pid_file.clone()),
        );

        assert!(handle.execute());
        assert_eq!(pid_file.read(), handle.pid());

        assert!(handle.shut_down(Signal::SIGTERM));
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_attach_to_running_instance() {
        let (dir, ctx) = context();
        let pid_file = PidFile::new(dir.path().join("sleep.pid"), PidFileOwner::Supervisor);
        let descriptor =
            ProcessDescriptor::new("sleep", "/bin/sleep 100").with_pid_file(pid_file.clone());

        let first = ProcessHandle::new(&ctx, descriptor.clone());
        assert!(first.execute());
        let pid = first.pid().unwrap();

        // A second handle finds the live instance instead of spawning another.
        let second = ProcessHandle::new(&ctx, descriptor);
        assert!(second.execute());
        assert_eq!(second.pid(), Some(pid));

        assert!(first.shut_down(Signal::SIGTERM));
        assert!(!second.is_alive());
    }

    #[test]
    fn test_stale_pid_file_is_ignored() {
        let (dir, ctx) = context();
        let pid_file = PidFile::new(dir.path().join("sleep.pid"), PidFileOwner::Supervisor);
        // Our own PID is alive but is not named "sleep".
        pid_file.write(std::process::id()).unwrap();

        let handle = ProcessHandle::new(
            &ctx,
            ProcessDescriptor::new("sleep", "/bin/sleep 100").with_pid_file(pid_file.clone()),
        );
        assert!(handle.execute());
        assert_ne!(handle.pid(), Some(std::process::id()));
        assert!(handle.shut_down(Signal::SIGTERM));
    }

    #[test]
    fn test_supervisee_owned_pid_file() {
        let (dir, ctx) = context();
        let pid_path = dir.path().join("self.pid");
        let script = dir.path().join("self-register.sh");
        fs::write(
            &script,
            format!("echo $$ > {}\nexec /bin/sleep 100\n", pid_path.display()),
        )
        .unwrap();

        let handle = ProcessHandle::new(
            &ctx,
            ProcessDescriptor::new("sleep", format!("/bin/sh {}", script.display()))
                .with_pid_file(PidFile::new(&pid_path, PidFileOwner::Supervisee)),
        )
        .with_pid_poll(40, Duration::from_millis(50));

        assert!(handle.execute());
        let pid = handle.pid().unwrap();
        assert_eq!(fs::read_to_string(&pid_path).unwrap().trim(), pid.to_string());

        assert!(handle.shut_down(Signal::SIGTERM));
        // Supervisee-owned files are left for the program to manage.
        assert!(pid_path.exists());
    }

    #[test]
    fn test_supervisee_never_registers() {
        let (dir, ctx) = context();
        let handle = ProcessHandle::new(
            &ctx,
            ProcessDescriptor::new("sleep", "/bin/sleep 100").with_pid_file(PidFile::new(
                dir.path().join("never.pid"),
                PidFileOwner::Supervisee,
            )),
        )
        .with_pid_poll(4, Duration::from_millis(25));

        assert!(!handle.execute());
        assert_eq!(handle.state(), ProcessState::Unstarted);
        assert_eq!(handle.pid(), None);
    }

    #[test]
    fn test_cancelled_pid_wait_returns_promptly() {
        let (dir, ctx) = context();
        let handle = ProcessHandle::new(
            &ctx,
            ProcessDescriptor::new("sleep", "/bin/sleep 100").with_pid_file(PidFile::new(
                dir.path().join("never.pid"),
                PidFileOwner::Supervisee,
            )),
        )
        .with_pid_poll(1000, Duration::from_millis(100));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = Instant::now();
        assert!(!handle.execute_cancellable(&cancel));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_graceful_shutdown_command() {
        let (dir, ctx) = context();
        let pid_path = dir.path().join("sleep.pid");
        let stop = dir.path().join("stop.sh");
        fs::write(&stop, format!("kill $(cat {})\n", pid_path.display())).unwrap();

        let handle = ProcessHandle::new(
            &ctx,
            ProcessDescriptor::new("sleep", "/bin/sleep 100")
                .with_shutdown_command(format!("/bin/sh {}", stop.display()))
                .with_pid_file(PidFile::new(&pid_path, PidFileOwner::Supervisor)),
        )
        .with_pid_poll(40, Duration::from_millis(50));

        assert!(handle.execute());
        let pid = handle.pid().unwrap();
        assert!(handle.shut_down(Signal::SIGTERM));
        assert!(!platform::is_process_alive(pid));
    }

    #[test]
    fn test_failing_shutdown_command_escalates() {
        let (_dir, ctx) = context();
        let handle = ProcessHandle::new(
            &ctx,
            ProcessDescriptor::new("sleep", "/bin/sleep 100").with_shutdown_command("/bin/false"),
        )
        .with_pid_poll(4, Duration::from_millis(25));

        assert!(handle.execute());
        let pid = handle.pid().unwrap();
        assert!(handle.shut_down(Signal::SIGTERM));
        assert!(!platform::is_process_alive(pid));
    }
}
