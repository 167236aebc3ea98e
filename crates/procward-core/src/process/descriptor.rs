//! Static description of a supervised program and its PID file.

use crate::error::{ProcwardError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Which side writes the PID file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PidFileOwner {
    /// The spawning handle writes the file after spawn and removes it on stop.
    #[default]
    Supervisor,
    /// The supervised program writes the file itself.
    Supervisee,
}

/// A PID file: plain text, one integer, newline-terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
    owner: PidFileOwner,
}

impl PidFile {
    pub fn new(path: impl AsRef<Path>, owner: PidFileOwner) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            owner,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> PidFileOwner {
        self.owner
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the PID, if the file exists and holds a positive integer.
    pub fn read(&self) -> Option<u32> {
        let contents = fs::read_to_string(&self.path).ok()?;
        match contents.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Some(pid),
            Ok(_) => None,
            Err(e) => {
                debug!("Invalid PID in {:?}: {}", self.path, e);
                None
            }
        }
    }

    /// Read the PID only if the file was written at or after `since`.
    ///
    /// `since` is truncated to whole seconds so file systems with coarse
    /// timestamps still accept a file written right after spawn.
    pub fn read_fresh(&self, since: SystemTime) -> Option<u32> {
        let modified = fs::metadata(&self.path).ok()?.modified().ok()?;
        if modified < truncate_to_second(since) {
            debug!("Ignoring stale PID file {:?}", self.path);
            return None;
        }
        self.read()
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ProcwardError::io_with_path(e, parent))?;
        }
        fs::write(&self.path, format!("{}\n", pid))
            .map_err(|e| ProcwardError::io_with_path(e, &self.path))
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProcwardError::io_with_path(e, &self.path)),
        }
    }
}

fn truncate_to_second(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => UNIX_EPOCH + Duration::from_secs(elapsed.as_secs()),
        Err(_) => time,
    }
}

/// Split a command line on whitespace into program and arguments.
///
/// Returns `None` for an empty command.
pub fn tokenize(command: &str) -> Option<(&str, Vec<&str>)> {
    let mut tokens = command.split_whitespace();
    let program = tokens.next()?;
    Some((program, tokens.collect()))
}

/// What to run, what it is called, and how to stop it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescriptor {
    name: String,
    startup_command: String,
    shutdown_command: Option<String>,
    pid_file: Option<PidFile>,
}

impl ProcessDescriptor {
    /// Create a descriptor.
    ///
    /// # Arguments
    ///
    /// * `name` - Expected process name, as the process table reports it
    /// * `startup_command` - Executable path followed by whitespace-separated arguments
    pub fn new(name: impl Into<String>, startup_command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            startup_command: startup_command.into(),
            shutdown_command: None,
            pid_file: None,
        }
    }

    /// Set a graceful stop command, run instead of signalling.
    pub fn with_shutdown_command(mut self, command: impl Into<String>) -> Self {
        self.shutdown_command = Some(command.into());
        self
    }

    pub fn with_pid_file(mut self, pid_file: PidFile) -> Self {
        self.pid_file = Some(pid_file);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn startup_command(&self) -> &str {
        &self.startup_command
    }

    pub fn shutdown_command(&self) -> Option<&str> {
        self.shutdown_command.as_deref()
    }

    pub fn pid_file(&self) -> Option<&PidFile> {
        self.pid_file.as_ref()
    }
}
