//! System V message queue wrapper.
//!
//! The only place that talks to `msgget`/`msgsnd`/`msgrcv`/`msgctl`. Queue
//! ids are held in an atomic so [`MessageQueue::close`] can run while another
//! thread is blocked on the same queue. A blocked receive wakes when the owner
//! removes the queue (`EIDRM`); a blocked send polls with `IPC_NOWAIT` and
//! wakes when the queue is closed from either side.

// Intentional FFI boundary; each block is documented with `SAFETY:`.
#![allow(unsafe_code)]

use super::message::IpcMessage;
use crate::cancel::CancellationToken;
use crate::config::IpcConfig;
use crate::error::{ProcwardError, Result};
use libc::{c_int, c_long, c_void, key_t};
use nix::errno::Errno;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, warn};

const MESSAGE_TYPE: c_long = 1;

/// Bytes of `tag` and `size` preceding the payload.
const HEADER_SIZE: usize = 8;

/// In-memory layout of one queue entry, as `msgsnd`/`msgrcv` expect it.
#[repr(C)]
struct RawMessage {
    mtype: c_long,
    tag: i32,
    size: u32,
    data: [u8; IpcConfig::MAX_PAYLOAD_SIZE],
}

impl RawMessage {
    fn empty() -> Box<Self> {
        Box::new(Self {
            mtype: MESSAGE_TYPE,
            tag: 0,
            size: 0,
            data: [0; IpcConfig::MAX_PAYLOAD_SIZE],
        })
    }
}

/// Derive a queue key from a path.
///
/// Deterministic across processes; never `IPC_PRIVATE`. The path does not
/// need to exist.
pub fn queue_key(path: &Path) -> key_t {
    let hash = blake3::hash(path.as_os_str().as_bytes());
    let bytes = hash.as_bytes();
    let key = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x7fff_ffff;
    if key == libc::IPC_PRIVATE {
        1
    } else {
        key
    }
}

fn remove_queue(id: c_int) -> Result<()> {
    // SAFETY: IPC_RMID ignores the buffer argument, so null is valid.
    let rc = unsafe { libc::msgctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
    if rc < 0 {
        return Err(ProcwardError::queue_last("msgctl(IPC_RMID)"));
    }
    Ok(())
}

/// An open message queue.
#[derive(Debug)]
pub struct MessageQueue {
    /// -1 once closed.
    id: AtomicI32,
    /// Fired by `close`; wakes blocked senders.
    closed: CancellationToken,
    /// Owners remove the queue on close; others only detach.
    owner: bool,
}

impl MessageQueue {
    /// Remove any queue with this key and create an empty one we own.
    pub fn create(key: key_t) -> Result<Self> {
        // SAFETY: msgget takes only integer arguments.
        let existing = unsafe { libc::msgget(key, 0) };
        if existing >= 0 {
            debug!("Removing stale queue {} for key {:#x}", existing, key);
            if let Err(e) = remove_queue(existing) {
                warn!("{}", e);
            }
        }

        // SAFETY: msgget takes only integer arguments.
        let id = unsafe {
            libc::msgget(
                key,
                libc::IPC_CREAT | libc::IPC_EXCL | IpcConfig::QUEUE_PERMISSIONS,
            )
        };
        if id < 0 {
            return Err(ProcwardError::queue_last("msgget(IPC_CREAT)"));
        }
        debug!("Created queue {} for key {:#x}", id, key);

        Ok(Self {
            id: AtomicI32::new(id),
            closed: CancellationToken::new(),
            owner: true,
        })
    }

    /// Attach to an existing queue.
    pub fn attach(key: key_t) -> Result<Self> {
        // SAFETY: msgget takes only integer arguments.
        let id = unsafe { libc::msgget(key, 0) };
        if id < 0 {
            return Err(ProcwardError::queue_last("msgget"));
        }
        debug!("Attached to queue {} for key {:#x}", id, key);

        Ok(Self {
            id: AtomicI32::new(id),
            closed: CancellationToken::new(),
            owner: false,
        })
    }

    fn id(&self, call: &'static str) -> Result<c_int> {
        let id = self.id.load(Ordering::SeqCst);
        if id < 0 {
            return Err(ProcwardError::Queue {
                call,
                errno: Errno::EIDRM,
            });
        }
        Ok(id)
    }

    /// Enqueue one message.
    ///
    /// Non-blocking sends fail with `EAGAIN` when the queue is full. Blocking
    /// sends retry until there is room or the queue is closed.
    pub fn send(&self, message: &IpcMessage, blocking: bool) -> Result<()> {
        message.check_size()?;
        let size = message.payload.len();

        let mut raw = RawMessage::empty();
        raw.tag = message.tag;
        raw.size = size as u32;
        raw.data[..size].copy_from_slice(&message.payload);

        loop {
            let id = self.id("msgsnd")?;
            // SAFETY: `raw` is a live, properly laid out message whose text
            // (tag, size and data) is at least HEADER_SIZE + size bytes long.
            let rc = unsafe {
                libc::msgsnd(
                    id,
                    &*raw as *const RawMessage as *const c_void,
                    HEADER_SIZE + size,
                    libc::IPC_NOWAIT,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::EAGAIN if blocking => {
                    self.closed.wait_timeout(IpcConfig::RETRY_INTERVAL);
                }
                errno => {
                    return Err(ProcwardError::Queue {
                        call: "msgsnd",
                        errno,
                    })
                }
            }
        }
    }

    /// Dequeue the oldest message.
    ///
    /// Non-blocking receives fail with `ENOMSG` when the queue is empty. An
    /// entry that is not one of ours is still consumed: oversized entries are
    /// truncated and short ones fail as a decode error.
    pub fn receive(&self, blocking: bool) -> Result<IpcMessage> {
        let mut raw = RawMessage::empty();
        let flags = libc::MSG_NOERROR | if blocking { 0 } else { libc::IPC_NOWAIT };

        loop {
            let id = self.id("msgrcv")?;
            // SAFETY: `raw` is a live buffer with room for HEADER_SIZE +
            // MAX_PAYLOAD_SIZE bytes of message text after `mtype`.
            let rc = unsafe {
                libc::msgrcv(
                    id,
                    &mut *raw as *mut RawMessage as *mut c_void,
                    HEADER_SIZE + IpcConfig::MAX_PAYLOAD_SIZE,
                    0,
                    flags,
                )
            };
            if rc < 0 {
                match Errno::last() {
                    Errno::EINTR => continue,
                    errno => {
                        return Err(ProcwardError::Queue {
                            call: "msgrcv",
                            errno,
                        })
                    }
                }
            }

            let received = rc as usize;
            if received < HEADER_SIZE {
                return Err(ProcwardError::Json {
                    message: format!("Truncated queue message of {} bytes", received),
                    source: None,
                });
            }
            let size = (raw.size as usize).min(received - HEADER_SIZE);
            return Ok(IpcMessage::new(raw.tag, raw.data[..size].to_vec()));
        }
    }

    /// Number of messages currently queued.
    pub fn pending(&self) -> Result<usize> {
        let id = self.id("msgctl(IPC_STAT)")?;
        // SAFETY: msqid_ds is plain old data; all-zero is a valid value.
        let mut stat: libc::msqid_ds = unsafe { std::mem::zeroed() };
        // SAFETY: `stat` is a valid, writable msqid_ds.
        let rc = unsafe { libc::msgctl(id, libc::IPC_STAT, &mut stat) };
        if rc < 0 {
            return Err(ProcwardError::queue_last("msgctl(IPC_STAT)"));
        }
        Ok(stat.msg_qnum as usize)
    }

    /// Close the queue, removing it if we own it.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let id = self.id.swap(-1, Ordering::SeqCst);
        if id < 0 {
            return false;
        }
        self.closed.cancel();
        if self.owner {
            match remove_queue(id) {
                Ok(()) => debug!("Removed queue {}", id),
                Err(e) => debug!("{}", e),
            }
        }
        true
    }
}

/// Enqueue `text` as one raw entry, with no tag or size header.
#[cfg(test)]
pub(crate) fn send_raw_text(key: key_t, text: &[u8]) -> Result<()> {
    let queue = MessageQueue::attach(key)?;
    let id = queue.id("msgsnd")?;
    let mut entry = MESSAGE_TYPE.to_ne_bytes().to_vec();
    entry.extend_from_slice(text);
    // SAFETY: `entry` is an mtype followed by `text.len()` bytes of text.
    let rc = unsafe {
        libc::msgsnd(
            id,
            entry.as_ptr() as *const c_void,
            text.len(),
            libc::IPC_NOWAIT,
        )
    };
    if rc < 0 {
        return Err(ProcwardError::queue_last("msgsnd"));
    }
    Ok(())
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.close();
    }
}
