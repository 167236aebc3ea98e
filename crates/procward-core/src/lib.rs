//! Procward Core - process supervision and supervisor/supervisee IPC.
//!
//! Starts external programs, watches them on a timer, restarts them per a
//! policy when they die or exceed memory/CPU ceilings, and exchanges JSON
//! control messages with them over System V message queues.
//!
//! # Example
//!
//! ```rust,no_run
//! use procward_core::{
//!     DefaultPolicy, ManagedDaemon, ProcessDescriptor, RuntimeContext, SupervisorOptions,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> procward_core::Result<()> {
//!     let ctx = RuntimeContext::new("/var/run/procward")?;
//!
//!     let daemon = ManagedDaemon::supervise(
//!         &ctx,
//!         "media",
//!         ProcessDescriptor::new("media-server", "/usr/bin/media-server --foreground"),
//!         Arc::new(DefaultPolicy),
//!         SupervisorOptions::default().with_memory_ceiling(0.25),
//!         |message: serde_json::Value| println!("media says {}", message),
//!     )?;
//!
//!     daemon.send(&serde_json::json!({"cmd": "reload"}));
//!     Ok(())
//! }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("procward-core requires Linux (System V message queues and /proc)");

pub mod cancel;
pub mod clock;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod platform;
pub mod process;
pub mod supervisor;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use clock::{Clock, SystemClock};
pub use config::{EscalationConfig, ServiceConfig};
pub use context::RuntimeContext;
pub use daemon::{ManagedDaemon, MessageHandler};
pub use error::{ProcwardError, Result};
pub use ipc::{ChannelDirection, ChannelMode, IpcChannel, IpcMessage};
pub use process::{
    PidFile, PidFileOwner, ProcessDescriptor, ProcessHandle, ProcessState, ProcessTable,
    ResourceSample,
};
pub use supervisor::{
    Action, DefaultPolicy, EscalatingPolicy, SupervisionPolicy, Supervisor, SupervisorOptions,
    SupervisorStatus,
};
