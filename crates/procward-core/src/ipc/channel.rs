//! One-directional control channel over a System V queue.
//!
//! The reader owns the queue: opening a reader discards any queue left behind
//! under the same key, and closing it removes the queue. A writer only
//! attaches, lazily on first write if the reader is not up yet, and
//! re-attaches if the reader recreated the queue.

use super::message::IpcMessage;
use super::sysv::{queue_key, MessageQueue};
use super::ChannelMode;
use crate::error::{ProcwardError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// A named, one-directional message channel.
#[derive(Debug)]
pub struct IpcChannel {
    path: PathBuf,
    key: libc::key_t,
    mode: ChannelMode,
    queue: Mutex<Option<Arc<MessageQueue>>>,
    closed: AtomicBool,
}

impl IpcChannel {
    /// Open a channel.
    ///
    /// A reader fails if the queue cannot be created. A writer always
    /// succeeds; attachment is retried on write.
    pub fn open(path: impl AsRef<Path>, mode: ChannelMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let key = queue_key(&path);

        let queue = match mode {
            ChannelMode::Reader => Some(Arc::new(MessageQueue::create(key)?)),
            ChannelMode::Writer => match MessageQueue::attach(key) {
                Ok(queue) => Some(Arc::new(queue)),
                Err(e) => {
                    debug!("Writer for {} not attached yet: {}", path.display(), e);
                    None
                }
            },
        };
        debug!("Opened {:?} channel {}", mode, path.display());

        Ok(Self {
            path,
            key,
            mode,
            queue: Mutex::new(queue),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<MessageQueue>>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed_error(&self) -> ProcwardError {
        ProcwardError::ChannelClosed(self.path.clone())
    }

    /// Current queue, attaching a writer if needed.
    fn queue(&self) -> Result<Arc<MessageQueue>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut queue = self.lock();
        if let Some(ref queue) = *queue {
            return Ok(Arc::clone(queue));
        }
        match self.mode {
            ChannelMode::Reader => Err(self.closed_error()),
            ChannelMode::Writer => {
                let attached = Arc::new(MessageQueue::attach(self.key)?);
                *queue = Some(Arc::clone(&attached));
                Ok(attached)
            }
        }
    }

    /// Drop a writer's stale attachment so the next write re-attaches.
    fn detach(&self, stale: &Arc<MessageQueue>) {
        let mut queue = self.lock();
        if queue.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
            *queue = None;
        }
    }

    /// Send one message, returning the underlying error.
    pub fn send(&self, message: &IpcMessage, blocking: bool) -> Result<()> {
        if self.mode != ChannelMode::Writer {
            return Err(ProcwardError::Other(format!(
                "{} is not open for writing",
                self.path.display()
            )));
        }
        message.check_size()?;

        let queue = self.queue()?;
        match queue.send(message, blocking) {
            Err(e) if e.is_queue_removed() && self.is_closed() => Err(self.closed_error()),
            Err(e) if e.is_queue_removed() => {
                debug!("Queue for {} was recreated; re-attaching", self.path.display());
                self.detach(&queue);
                self.queue()?.send(message, blocking)
            }
            result => result,
        }
    }

    /// Receive one message, returning the underlying error.
    ///
    /// Once the channel is closed this fails with an error for which
    /// [`ProcwardError::is_queue_removed`] is true.
    pub fn receive(&self, blocking: bool) -> Result<IpcMessage> {
        if self.mode != ChannelMode::Reader {
            return Err(ProcwardError::Other(format!(
                "{} is not open for reading",
                self.path.display()
            )));
        }
        let queue = self.queue()?;
        match queue.receive(blocking) {
            Err(e) if e.is_queue_removed() => Err(self.closed_error()),
            result => result,
        }
    }

    /// Send one message. Returns `false` if the payload is too large, the
    /// queue is unavailable, or a non-blocking send found it full.
    ///
    /// A blocking write waits for room in the queue; closing the channel from
    /// another thread makes it return `false`.
    pub fn write(&self, message: &IpcMessage, blocking: bool) -> bool {
        match self.send(message, blocking) {
            Ok(()) => true,
            Err(ProcwardError::ChannelClosed(_)) => {
                debug!("Write to closed channel {}", self.path.display());
                false
            }
            Err(e) if e.is_transient() => {
                debug!("Write to {} would block", self.path.display());
                false
            }
            Err(e @ ProcwardError::PayloadTooLarge { .. }) => {
                error!("Write to {} rejected: {}", self.path.display(), e);
                false
            }
            Err(e) => {
                warn!("Write to {} failed: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Receive one message. Returns `None` if a non-blocking read found the
    /// queue empty, or the channel is closed.
    pub fn read(&self, blocking: bool) -> Option<IpcMessage> {
        match self.receive(blocking) {
            Ok(message) => Some(message),
            Err(e) if e.is_transient() || e.is_queue_removed() => None,
            Err(e) => {
                warn!("Read from {} failed: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Serialize `value` as JSON and send it.
    pub fn write_json<T: Serialize + ?Sized>(&self, value: &T, blocking: bool) -> bool {
        match IpcMessage::from_json(value) {
            Ok(message) => self.write(&message, blocking),
            Err(e) => {
                error!("Cannot encode message for {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Receive one message and decode it as JSON.
    ///
    /// A malformed payload is consumed, logged and reported as `None`.
    pub fn read_json<T: DeserializeOwned>(&self, blocking: bool) -> Option<T> {
        let message = self.read(blocking)?;
        match message.decode_json() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding undecodable message on {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Number of messages waiting in the queue.
    pub fn pending(&self) -> Result<usize> {
        self.queue()?.pending()
    }

    /// Close the channel. A reader removes the queue, which wakes a thread
    /// blocked in [`IpcChannel::read`]. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(queue) = self.lock().take() {
            queue.close();
        }
        debug!("Closed channel {}", self.path.display());
    }
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        self.close();
    }
}
