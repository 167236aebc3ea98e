//! Control channels between a supervisor and its supervisee.
//!
//! Each direction is a separate System V message queue keyed by a path under
//! the run directory. Messages are discrete and FIFO within one direction.
//!
//! - **sysv**: raw queue wrapper (the only FFI in the crate)
//! - **message**: wire message and JSON helpers
//! - **channel**: [`IpcChannel`], reader/writer semantics on top of a queue

mod channel;
mod message;
mod sysv;

pub use channel::IpcChannel;
pub use message::IpcMessage;
pub use sysv::queue_key;

#[cfg(test)]
pub(crate) use sysv::send_raw_text;

use serde::{Deserialize, Serialize};

/// Which end of a channel this handle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Owns and resets the queue.
    Reader,
    Writer,
}

/// Direction of travel, relative to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelDirection {
    ToSupervisee,
    ToSupervisor,
}

impl ChannelDirection {
    /// Index used in the channel path.
    pub fn index(self) -> u8 {
        match self {
            ChannelDirection::ToSupervisee => 0,
            ChannelDirection::ToSupervisor => 1,
        }
    }
}
