//! Error types for procward.
//!
//! Internal layers (queue wrapper, config loading, context setup) return these
//! errors. The supervision-facing operations convert them into boolean or
//! `Option` outcomes and log them, so nothing here crosses a thread boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the procward library.
#[derive(Debug, Error)]
pub enum ProcwardError {
    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid command: {0:?}")]
    InvalidCommand(String),

    // Process errors
    #[error("Failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("Failed to deliver signal to {pid}: {errno}")]
    Signal { pid: u32, errno: nix::errno::Errno },

    // IPC errors
    #[error("Message queue {call} failed: {errno}")]
    Queue {
        call: &'static str,
        errno: nix::errno::Errno,
    },

    #[error("Payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Channel closed: {0}")]
    ChannelClosed(PathBuf),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for procward operations.
pub type Result<T> = std::result::Result<T, ProcwardError>;

impl From<std::io::Error> for ProcwardError {
    fn from(err: std::io::Error) -> Self {
        ProcwardError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ProcwardError {
    fn from(err: serde_json::Error) -> Self {
        ProcwardError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<nix::errno::Errno> for ProcwardError {
    fn from(errno: nix::errno::Errno) -> Self {
        std::io::Error::from(errno).into()
    }
}

impl ProcwardError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ProcwardError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a queue error from the current `errno`.
    pub fn queue_last(call: &'static str) -> Self {
        ProcwardError::Queue {
            call,
            errno: nix::errno::Errno::last(),
        }
    }

    /// Check if this error is a transient condition the caller should retry.
    ///
    /// Covers a full queue on a non-blocking send, an empty queue on a
    /// non-blocking receive, and interrupted system calls.
    pub fn is_transient(&self) -> bool {
        use nix::errno::Errno;
        matches!(
            self,
            ProcwardError::Queue {
                errno: Errno::EAGAIN | Errno::ENOMSG | Errno::EINTR,
                ..
            }
        )
    }

    /// Check if this error means the underlying queue no longer exists.
    pub fn is_queue_removed(&self) -> bool {
        use nix::errno::Errno;
        matches!(
            self,
            ProcwardError::Queue {
                errno: Errno::EIDRM | Errno::EINVAL,
                ..
            }
        ) || matches!(self, ProcwardError::ChannelClosed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn test_error_display() {
        let err = ProcwardError::PayloadTooLarge {
            size: 9000,
            max: 8000,
        };
        assert_eq!(err.to_string(), "Payload of 9000 bytes exceeds maximum 8000");
    }

    #[test]
    fn test_transient_errors() {
        assert!(ProcwardError::Queue {
            call: "msgsnd",
            errno: Errno::EAGAIN
        }
        .is_transient());
        assert!(ProcwardError::Queue {
            call: "msgrcv",
            errno: Errno::ENOMSG
        }
        .is_transient());
        assert!(!ProcwardError::Queue {
            call: "msgrcv",
            errno: Errno::EIDRM
        }
        .is_transient());
        assert!(!ProcwardError::Config {
            message: "bad".into()
        }
        .is_transient());
    }

    #[test]
    fn test_queue_removed() {
        assert!(ProcwardError::Queue {
            call: "msgrcv",
            errno: Errno::EIDRM
        }
        .is_queue_removed());
        assert!(ProcwardError::ChannelClosed(PathBuf::from("/tmp/x")).is_queue_removed());
        assert!(!ProcwardError::Other("x".into()).is_queue_removed());
    }

    #[test]
    fn test_io_with_path() {
        let err = ProcwardError::io_with_path(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "/run/procward/a.pid",
        );
        assert!(err.to_string().contains("a.pid"));
    }
}
