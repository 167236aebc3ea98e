//! Platform abstraction layer.
//!
//! All OS-specific calls live here or in the `ipc::sysv` queue wrapper, so
//! the supervision logic above them stays free of raw syscalls.
//!
//! - `process` - signal delivery, liveness, termination

pub mod process;

pub use process::{
    force_kill, is_process_alive, is_zombie, reap, send_signal, terminate_process, wait_for_exit,
};
