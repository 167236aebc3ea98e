//! Process supervision.
//!
//! A [`Supervisor`] runs one background loop per [`crate::process::ProcessHandle`],
//! consults a [`SupervisionPolicy`] on dead processes and ceiling breaches,
//! and restarts or backs off accordingly.

mod counters;
mod monitor;
mod options;
mod policy;

pub use counters::{CounterSnapshot, ViolationCounters};
pub use monitor::{ExitCallback, Supervisor, SupervisorStatus};
pub use options::SupervisorOptions;
pub use policy::{Action, DefaultPolicy, EscalatingPolicy, SupervisionPolicy};
