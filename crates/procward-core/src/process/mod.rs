//! Process lifecycle.
//!
//! - [`ProcessTable`] scans the OS process registry by name
//! - [`ProcessDescriptor`] and [`PidFile`] describe what to run
//! - [`ProcessHandle`] starts, stops and probes one instance
//!
//! # Example
//!
//! ```rust,no_run
//! use procward_core::process::{ProcessDescriptor, ProcessHandle};
//! use procward_core::RuntimeContext;
//! use nix::sys::signal::Signal;
//!
//! fn main() -> procward_core::Result<()> {
//!     let ctx = RuntimeContext::new("/tmp/procward")?;
//!     let handle = ProcessHandle::new(&ctx, ProcessDescriptor::new("sleep", "/bin/sleep 100"));
//!
//!     if handle.execute() {
//!         println!("running as {:?}", handle.pid());
//!         handle.shut_down(Signal::SIGTERM);
//!     }
//!     Ok(())
//! }
//! ```

mod descriptor;
mod handle;
mod table;

pub use descriptor::{tokenize, PidFile, PidFileOwner, ProcessDescriptor};
pub use handle::{ProcessHandle, ProcessState};
pub use table::{name_matches, ProcessTable, ResourceSample};
