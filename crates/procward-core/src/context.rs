//! Caller-owned runtime context.
//!
//! Holds what every component needs and nothing process-wide: the run
//! directory where control channels and PID files live, the shared process
//! table reader and the time source. Construct one per application and pass
//! it by reference to each component constructor.

use crate::clock::{Clock, SystemClock};
use crate::config::IpcConfig;
use crate::error::{ProcwardError, Result};
use crate::ipc::ChannelDirection;
use crate::process::ProcessTable;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Shared state for one procward runtime.
#[derive(Clone)]
pub struct RuntimeContext {
    run_dir: PathBuf,
    process_table: Arc<ProcessTable>,
    clock: Arc<dyn Clock>,
}

impl RuntimeContext {
    /// Create a context, creating `run_dir` if needed.
    pub fn new(run_dir: impl AsRef<Path>) -> Result<Self> {
        let run_dir = run_dir.as_ref().to_path_buf();
        fs::create_dir_all(&run_dir).map_err(|e| ProcwardError::io_with_path(e, &run_dir))?;
        debug!("Runtime context at {}", run_dir.display());

        Ok(Self {
            run_dir,
            process_table: Arc::new(ProcessTable::new()),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn process_table(&self) -> &Arc<ProcessTable> {
        &self.process_table
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Path of the control channel for `alias` in one direction.
    ///
    /// Both ends compute the same path from the same inputs:
    /// `<run_dir>/<alias>-<index><suffix>`.
    pub fn channel_path(&self, alias: &str, direction: ChannelDirection) -> PathBuf {
        self.run_dir.join(format!(
            "{}-{}{}",
            alias,
            direction.index(),
            IpcConfig::CHANNEL_SUFFIX
        ))
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("run_dir", &self.run_dir)
            .finish_non_exhaustive()
    }
}
