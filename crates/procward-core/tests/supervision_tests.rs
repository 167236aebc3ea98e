//! Integration tests for process handles and the supervisor loop.
//!
//! These run real `/bin/sleep` children under short tick intervals.

use chrono::{DateTime, TimeZone, Utc};
use nix::sys::signal::Signal;
use procward_core::platform;
use procward_core::{
    Action, Clock, DefaultPolicy, EscalatingPolicy, ProcessDescriptor, ProcessHandle,
    RuntimeContext, SupervisionPolicy, Supervisor, SupervisorOptions,
};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn create_test_env() -> (TempDir, RuntimeContext) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let ctx = RuntimeContext::new(temp_dir.path()).expect("Failed to create context");
    (temp_dir, ctx)
}

fn sleeper(ctx: &RuntimeContext) -> Arc<ProcessHandle> {
    Arc::new(ProcessHandle::new(
        ctx,
        ProcessDescriptor::new("sleep", "/bin/sleep 100"),
    ))
}

fn fast_options() -> SupervisorOptions {
    SupervisorOptions::default()
        .with_tick_interval(Duration::from_millis(50))
        .with_initial_grace(Duration::from_millis(50))
}

/// Poll `condition` until it holds or `timeout` elapses.
fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20));
    }
    condition()
}

/// Records dead-process hit counts and restarts.
#[derive(Default)]
struct RecordingPolicy {
    dead_hits: Mutex<Vec<u32>>,
}

impl SupervisionPolicy for RecordingPolicy {
    fn on_dead_process(&self, hits: u32) -> Action {
        self.dead_hits.lock().unwrap().push(hits);
        Action::Restart
    }
}

/// Always backs off.
struct AlwaysBackoff;

impl SupervisionPolicy for AlwaysBackoff {
    fn on_dead_process(&self, _hits: u32) -> Action {
        Action::Backoff
    }
}

/// Real monotonic time, frozen wall time.
#[derive(Debug)]
struct FrozenWallClock(DateTime<Utc>);

impl Clock for FrozenWallClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        self.0
    }
}

fn ghost(ctx: &RuntimeContext) -> Arc<ProcessHandle> {
    Arc::new(ProcessHandle::new(
        ctx,
        ProcessDescriptor::new("ghost", "/nonexistent/procward/ghost"),
    ))
}

#[test]
fn test_start_and_stop_sleep() {
    let (_dir, ctx) = create_test_env();
    let handle = sleeper(&ctx);

    assert!(handle.execute());
    assert!(eventually(Duration::from_secs(1), || handle.is_alive()));
    let pid = handle.pid().expect("running handle has a pid");
    assert!(pid > 0);

    assert!(handle.shut_down(Signal::SIGTERM));
    assert!(!platform::is_process_alive(pid));
}

#[test]
fn test_shut_down_twice_sends_nothing() {
    let (_dir, ctx) = create_test_env();
    let handle = sleeper(&ctx);

    assert!(handle.execute());
    assert!(handle.shut_down(Signal::SIGTERM));

    // Already stopped: immediate success with no process to signal.
    let start = Instant::now();
    assert!(handle.shut_down(Signal::SIGKILL));
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(handle.pid(), None);
}

#[test]
fn test_external_kill_is_restarted() {
    let (_dir, ctx) = create_test_env();
    let handle = sleeper(&ctx);
    let policy = Arc::new(RecordingPolicy::default());

    assert!(handle.execute());
    let first_pid = handle.pid().unwrap();

    let supervisor = Supervisor::new(&ctx, Arc::clone(&handle), policy.clone(), fast_options());
    assert!(supervisor.monitor());

    platform::send_signal(first_pid, Signal::SIGKILL).unwrap();

    assert!(eventually(Duration::from_secs(5), || {
        supervisor.status().restarts >= 1 && handle.is_alive()
    }));
    let second_pid = handle.pid().unwrap();
    assert_ne!(second_pid, first_pid);
    assert_eq!(policy.dead_hits.lock().unwrap().first(), Some(&1));

    supervisor.unmonitor();
    assert!(handle.shut_down(Signal::SIGTERM));
}

#[test]
fn test_monitor_guard() {
    let (_dir, ctx) = create_test_env();
    let handle = sleeper(&ctx);
    assert!(handle.execute());

    let supervisor = Supervisor::new(
        &ctx,
        Arc::clone(&handle),
        Arc::new(RecordingPolicy::default()),
        fast_options(),
    );
    assert!(supervisor.monitor());
    assert!(!supervisor.monitor());

    supervisor.unmonitor();
    // Unmonitor leaves the process alone.
    assert!(handle.is_alive());
    assert!(handle.shut_down(Signal::SIGTERM));
}

#[test]
fn test_unmonitor_interrupts_backoff() {
    let (_dir, ctx) = create_test_env();
    let supervisor = Supervisor::new(
        &ctx,
        ghost(&ctx),
        Arc::new(AlwaysBackoff),
        SupervisorOptions::default()
            .with_initial_grace(Duration::ZERO)
            .with_tick_interval(Duration::from_millis(10))
            .with_backoff_interval(Duration::from_secs(60)),
    );
    assert!(supervisor.monitor());

    // Let the first tick enter its backoff wait.
    assert!(eventually(Duration::from_secs(2), || {
        supervisor.status().counters.dead >= 1
    }));
    sleep(Duration::from_millis(50));

    let start = Instant::now();
    supervisor.unmonitor();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(!supervisor.is_monitored());
}

#[test]
fn test_memory_ceiling_triggers_restart() {
    let (_dir, ctx) = create_test_env();
    let handle = sleeper(&ctx);
    assert!(handle.execute());
    let first_pid = handle.pid().unwrap();

    // Any resident process exceeds a ceiling this small.
    let supervisor = Supervisor::new(
        &ctx,
        Arc::clone(&handle),
        Arc::new(RecordingPolicy::default()),
        fast_options().with_memory_ceiling(1e-9),
    );
    assert!(supervisor.monitor());

    assert!(eventually(Duration::from_secs(5), || {
        supervisor.status().restarts >= 1
    }));
    supervisor.unmonitor();

    assert!(!platform::is_process_alive(first_pid));
    assert!(handle.shut_down(Signal::SIGTERM));
}

#[test]
fn test_backoff_delays_restart() {
    let (_dir, ctx) = create_test_env();
    let handle = sleeper(&ctx);
    assert!(handle.execute());
    let first_pid = handle.pid().unwrap();

    let backoff = Duration::from_millis(300);
    let supervisor = Supervisor::new(
        &ctx,
        Arc::clone(&handle),
        Arc::new(AlwaysBackoff),
        fast_options().with_backoff_interval(backoff),
    );
    assert!(supervisor.monitor());

    let killed = Instant::now();
    platform::send_signal(first_pid, Signal::SIGKILL).unwrap();

    // The death is seen, but the restart waits out the backoff.
    assert!(eventually(Duration::from_secs(2), || {
        supervisor.status().counters.dead >= 1
    }));
    assert_eq!(supervisor.status().restarts, 0);

    assert!(eventually(Duration::from_secs(5), || {
        supervisor.status().restarts >= 1 && handle.is_alive()
    }));
    assert!(killed.elapsed() >= backoff);

    supervisor.unmonitor();
    assert!(handle.shut_down(Signal::SIGTERM));
}

#[test]
fn test_escalating_policy_gives_up() {
    let (_dir, ctx) = create_test_env();
    let supervisor = Supervisor::new(
        &ctx,
        ghost(&ctx),
        Arc::new(EscalatingPolicy::new(2, Some(3), 0)),
        SupervisorOptions::default()
            .with_initial_grace(Duration::ZERO)
            .with_tick_interval(Duration::from_millis(10))
            .with_backoff_interval(Duration::from_millis(20)),
    );

    let (tx, rx) = mpsc::channel();
    supervisor.set_exit_hook(move |action| {
        let _ = tx.send(action);
    });
    assert!(supervisor.monitor());

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Action::Shutdown
    );
    let status = supervisor.status();
    assert!(!status.monitored);
    assert_eq!(status.exit_action, Some(Action::Shutdown));
    assert_eq!(status.counters.dead, 3);
    assert_eq!(status.restarts, 0);
}

#[test]
fn test_status_stamped_by_context_clock() {
    let (_dir, ctx) = create_test_env();
    let frozen = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let ctx = ctx.with_clock(Arc::new(FrozenWallClock(frozen)));

    let handle = sleeper(&ctx);
    assert!(handle.execute());
    let supervisor = Supervisor::new(
        &ctx,
        Arc::clone(&handle),
        Arc::new(DefaultPolicy),
        fast_options(),
    );
    assert!(supervisor.monitor());

    assert!(eventually(Duration::from_secs(2), || {
        supervisor.status().last_check.is_some()
    }));
    assert_eq!(supervisor.status().last_check, Some(frozen));

    supervisor.unmonitor();
    assert!(handle.shut_down(Signal::SIGTERM));
}
