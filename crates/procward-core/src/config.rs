//! Centralized configuration for procward.
//!
//! Constant groups hold the defaults for supervision timing, PID-file polling
//! and the IPC wire format. [`ServiceConfig`] is the JSON file an operator
//! writes to describe one supervised service.

use crate::error::{ProcwardError, Result};
use crate::process::{PidFile, PidFileOwner, ProcessDescriptor};
use crate::supervisor::{DefaultPolicy, EscalatingPolicy, SupervisionPolicy, SupervisorOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Supervisor timing defaults.
pub struct SupervisionConfig;

impl SupervisionConfig {
    pub const TICK_INTERVAL: Duration = Duration::from_millis(1000);
    /// Backoff interval as a multiple of the tick interval.
    pub const BACKOFF_MULTIPLIER: u32 = 10;
    pub const INITIAL_GRACE: Duration = Duration::from_millis(5000);
    /// How long a stopping process gets before it is force-killed.
    pub const SHUTDOWN_WAIT: Duration = Duration::from_millis(2000);
    pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);
}

/// PID file polling defaults.
pub struct PidFileConfig;

impl PidFileConfig {
    pub const POLL_RETRIES: u32 = 20;
    pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
}

/// IPC wire format and naming.
pub struct IpcConfig;

impl IpcConfig {
    /// Hard ceiling on a single message payload.
    pub const MAX_PAYLOAD_SIZE: usize = 8000;
    pub const CHANNEL_SUFFIX: &'static str = "-process-control.ipc";
    pub const QUEUE_PERMISSIONS: i32 = 0o600;
    /// How often a blocking send rechecks a full queue, and how long a
    /// listener pauses after a failed read.
    pub const RETRY_INTERVAL: Duration = Duration::from_millis(10);
    /// Tag carried by structured (JSON) messages.
    pub const JSON_TAG: i32 = 1;
    pub const DEFAULT_RUN_DIR: &'static str = "/var/run/procward";
}

fn default_run_dir() -> PathBuf {
    PathBuf::from(IpcConfig::DEFAULT_RUN_DIR)
}

fn default_tick_interval_ms() -> u64 {
    SupervisionConfig::TICK_INTERVAL.as_millis() as u64
}

fn default_initial_grace_ms() -> u64 {
    SupervisionConfig::INITIAL_GRACE.as_millis() as u64
}

/// Restart → backoff → give-up thresholds for [`EscalatingPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Consecutive dead ticks after which restarts are delayed by a backoff.
    pub backoff_after: u32,
    /// Consecutive dead ticks after which supervision stops.
    #[serde(default)]
    pub give_up_after: Option<u32>,
    /// Consecutive violating samples tolerated before restarting.
    #[serde(default)]
    pub violation_tolerance: u32,
}

/// One supervised service, as loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Alias used to name the control channels.
    pub alias: String,
    /// Expected process name as reported by the process table.
    pub name: String,
    pub startup_command: String,
    #[serde(default)]
    pub shutdown_command: Option<String>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    #[serde(default)]
    pub pid_file_owner: PidFileOwner,
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    /// Memory ceiling as a fraction of total system memory.
    #[serde(default)]
    pub memory_ceiling: Option<f64>,
    /// CPU ceiling as a fraction of total CPU capacity.
    #[serde(default)]
    pub cpu_ceiling: Option<f64>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub backoff_interval_ms: Option<u64>,
    #[serde(default = "default_initial_grace_ms")]
    pub initial_grace_ms: u64,
    #[serde(default)]
    pub escalation: Option<EscalationConfig>,
}

impl ServiceConfig {
    /// Load and validate a service file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).map_err(|e| ProcwardError::io_with_path(e, path))?;
        let config: ServiceConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that could never be supervised.
    pub fn validate(&self) -> Result<()> {
        if self.alias.trim().is_empty() {
            return Err(config_error("alias must not be empty"));
        }
        if self.alias.contains('/') {
            return Err(config_error("alias must not contain '/'"));
        }
        if self.startup_command.split_whitespace().next().is_none() {
            return Err(config_error("startup_command must not be empty"));
        }
        if self.tick_interval_ms == 0 {
            return Err(config_error("tick_interval_ms must be positive"));
        }
        for (field, ceiling) in [
            ("memory_ceiling", self.memory_ceiling),
            ("cpu_ceiling", self.cpu_ceiling),
        ] {
            if let Some(value) = ceiling {
                if !(value > 0.0 && value <= 1.0) {
                    return Err(config_error(&format!(
                        "{} must be in (0, 1], got {}",
                        field, value
                    )));
                }
            }
        }
        if let Some(escalation) = self.escalation {
            if let Some(give_up) = escalation.give_up_after {
                if give_up == 0 {
                    return Err(config_error("escalation.give_up_after must be positive"));
                }
            }
        }
        Ok(())
    }

    /// Build the process descriptor for this service.
    pub fn descriptor(&self) -> ProcessDescriptor {
        let mut descriptor = ProcessDescriptor::new(&self.name, &self.startup_command);
        if let Some(ref command) = self.shutdown_command {
            descriptor = descriptor.with_shutdown_command(command);
        }
        if let Some(ref path) = self.pid_file {
            descriptor = descriptor.with_pid_file(PidFile::new(path, self.pid_file_owner));
        }
        descriptor
    }

    /// Build the supervisor timing and ceilings for this service.
    pub fn supervisor_options(&self) -> SupervisorOptions {
        let mut options = SupervisorOptions::default()
            .with_tick_interval(Duration::from_millis(self.tick_interval_ms))
            .with_initial_grace(Duration::from_millis(self.initial_grace_ms));
        if let Some(ms) = self.backoff_interval_ms {
            options = options.with_backoff_interval(Duration::from_millis(ms));
        }
        if let Some(ceiling) = self.memory_ceiling {
            options = options.with_memory_ceiling(ceiling);
        }
        if let Some(ceiling) = self.cpu_ceiling {
            options = options.with_cpu_ceiling(ceiling);
        }
        options
    }

    /// Build the restart policy for this service.
    pub fn policy(&self) -> Arc<dyn SupervisionPolicy> {
        match self.escalation {
            Some(escalation) => Arc::new(EscalatingPolicy::from(escalation)),
            None => Arc::new(DefaultPolicy),
        }
    }
}

fn config_error(message: &str) -> ProcwardError {
    ProcwardError::Config {
        message: message.to_string(),
    }
}
