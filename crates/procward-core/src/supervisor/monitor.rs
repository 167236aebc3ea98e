//! The supervisor loop.
//!
//! One background thread per [`Supervisor`] probes its [`ProcessHandle`] once
//! per tick, asks the policy what to do, and restarts the process if needed.
//! Every wait in the loop observes a single cancellation token, so
//! [`Supervisor::unmonitor`] is prompt whether the loop is in its initial
//! grace, a tick or a backoff.

use super::counters::{CounterSnapshot, ViolationCounters};
use super::options::SupervisorOptions;
use super::policy::{Action, SupervisionPolicy};
use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::context::RuntimeContext;
use crate::process::{ProcessHandle, ProcessState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Invoked when the loop stops on a `Shutdown` or `Unmonitor` policy decision.
pub type ExitCallback = Arc<dyn Fn(Action) + Send + Sync + 'static>;

/// Point-in-time view of a supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub name: String,
    pub monitored: bool,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub counters: CounterSnapshot,
    pub last_check: Option<DateTime<Utc>>,
    /// Time since supervision started or the process was last restarted.
    pub since_start_ms: Option<u64>,
    /// The policy decision that ended the loop, if it ended that way.
    pub exit_action: Option<Action>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared with the loop thread.
struct Shared {
    handle: Arc<ProcessHandle>,
    policy: Arc<dyn SupervisionPolicy>,
    options: SupervisorOptions,
    clock: Arc<dyn Clock>,
    monitored: AtomicBool,
    counters: ViolationCounters,
    restarts: AtomicU32,
    last_check: Mutex<Option<DateTime<Utc>>>,
    last_start: Mutex<Option<Instant>>,
    exit_action: Mutex<Option<Action>>,
    on_exit: Mutex<Option<ExitCallback>>,
}

impl Shared {
    fn name(&self) -> &str {
        self.handle.descriptor().name()
    }

    /// Body of the loop thread. Returns the terminal action, or `None` if
    /// cancelled.
    fn run(&self, cancel: &CancellationToken) -> Option<Action> {
        if cancel.wait_timeout(self.options.initial_grace()) {
            return None;
        }

        loop {
            let action = match panic::catch_unwind(AssertUnwindSafe(|| self.tick(cancel))) {
                Ok(action) => action,
                Err(_) => {
                    error!("Supervisor tick for {} panicked; continuing", self.name());
                    Action::Normal
                }
            };

            if action.is_terminal() {
                return Some(action);
            }
            if cancel.wait_timeout(self.options.tick_interval()) {
                return None;
            }
        }
    }

    fn tick(&self, cancel: &CancellationToken) -> Action {
        let sample = self.handle.probe();
        *lock(&self.last_check) = Some(self.clock.wall());

        let action = self
            .counters
            .evaluate(sample, &self.options, self.policy.as_ref());

        match action {
            Action::Normal => {}
            Action::Restart => self.recover(cancel),
            Action::Backoff => {
                let backoff = self.options.backoff_interval();
                info!("Backing off {} for {:?}", self.name(), backoff);
                if !cancel.wait_timeout(backoff) {
                    self.recover(cancel);
                }
            }
            Action::Shutdown | Action::Unmonitor => {
                warn!("Policy ended supervision of {}: {:?}", self.name(), action);
            }
        }
        action
    }

    fn recover(&self, cancel: &CancellationToken) {
        let recovered = if self.handle.is_alive() {
            self.handle.restart_cancellable(cancel)
        } else {
            self.handle.execute_cancellable(cancel)
        };

        if recovered {
            *lock(&self.last_start) = Some(self.clock.now());
            let restarts = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            info!("Recovered {} (restart #{})", self.name(), restarts);
            cancel.wait_timeout(self.options.initial_grace());
        } else {
            warn!("Failed to recover {}; retrying next tick", self.name());
        }
    }
}

/// Periodic health check and restart policy for one process.
///
/// Dropping a supervisor stops its loop but leaves the process running.
pub struct Supervisor {
    shared: Arc<Shared>,
    cancel: Mutex<CancellationToken>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        ctx: &RuntimeContext,
        handle: Arc<ProcessHandle>,
        policy: Arc<dyn SupervisionPolicy>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                handle,
                policy,
                options,
                clock: ctx.clock().clone(),
                monitored: AtomicBool::new(false),
                counters: ViolationCounters::new(),
                restarts: AtomicU32::new(0),
                last_check: Mutex::new(None),
                last_start: Mutex::new(None),
                exit_action: Mutex::new(None),
                on_exit: Mutex::new(None),
            }),
            cancel: Mutex::new(CancellationToken::new()),
            thread: Mutex::new(None),
        }
    }

    /// Register a callback for when the loop stops by policy.
    pub fn set_exit_hook(&self, callback: impl Fn(Action) + Send + Sync + 'static) {
        *lock(&self.shared.on_exit) = Some(Arc::new(callback));
    }

    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.shared.handle
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.shared.options
    }

    pub fn is_monitored(&self) -> bool {
        self.shared.monitored.load(Ordering::SeqCst)
    }

    /// Start the loop thread.
    ///
    /// Returns `false` if the loop is already running or the thread could not
    /// be spawned. Does not start the process; call
    /// [`ProcessHandle::execute`] first.
    pub fn monitor(&self) -> bool {
        let shared = &self.shared;
        if shared
            .monitored
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("{} is already monitored", shared.name());
            return false;
        }

        // A loop that ended by policy has finished; collect it.
        if let Some(previous) = lock(&self.thread).take() {
            let _ = previous.join();
        }

        let cancel = CancellationToken::new();
        *lock(&self.cancel) = cancel.clone();
        *lock(&shared.exit_action) = None;
        *lock(&shared.last_start) = Some(shared.clock.now());
        shared.counters.reset();

        let thread_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("supervisor-{}", shared.name()))
            .spawn(move || {
                info!("Supervising {}", thread_shared.name());
                let exit = thread_shared.run(&cancel);
                thread_shared.monitored.store(false, Ordering::SeqCst);

                match exit {
                    Some(action) => {
                        *lock(&thread_shared.exit_action) = Some(action);
                        info!("Supervision of {} ended: {:?}", thread_shared.name(), action);
                        let hook = lock(&thread_shared.on_exit).clone();
                        if let Some(hook) = hook {
                            hook(action);
                        }
                    }
                    None => debug!("Supervision of {} cancelled", thread_shared.name()),
                }
            });

        match spawned {
            Ok(thread) => {
                *lock(&self.thread) = Some(thread);
                true
            }
            Err(e) => {
                error!("Failed to spawn supervisor thread: {}", e);
                shared.monitored.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Stop the loop and wait for its thread. The process is left running.
    pub fn unmonitor(&self) {
        lock(&self.cancel).cancel();

        let thread = lock(&self.thread).take();
        if let Some(thread) = thread {
            // Called from the exit hook: the loop is already finishing.
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Supervisor thread for {} panicked", self.shared.name());
            }
        }
        self.shared.monitored.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> SupervisorStatus {
        let shared = &self.shared;
        SupervisorStatus {
            name: shared.name().to_string(),
            monitored: self.is_monitored(),
            state: shared.handle.state(),
            pid: shared.handle.pid(),
            restarts: shared.restarts.load(Ordering::SeqCst),
            counters: shared.counters.snapshot(),
            last_check: *lock(&shared.last_check),
            since_start_ms: lock(&shared.last_start).map(|started| {
                shared.clock.now().saturating_duration_since(started).as_millis() as u64
            }),
            exit_action: *lock(&shared.exit_action),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.unmonitor();
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.shared.name())
            .field("monitored", &self.is_monitored())
            .finish_non_exhaustive()
    }
}
