//! Supervisor and supervisee ends of a managed service.
//!
//! A [`ManagedDaemon`] pairs two control channels (one per direction) with a
//! background listener that hands every inbound JSON message to a
//! [`MessageHandler`]. The supervisor end also owns a [`Supervisor`] for the
//! child process.
//!
//! ```text
//! supervisor end                        supervisee end
//!   write <alias>-0  ----------------->   read  <alias>-0
//!   read  <alias>-1  <-----------------   write <alias>-1
//! ```

use crate::config::IpcConfig;
use crate::context::RuntimeContext;
use crate::error::{ProcwardError, Result};
use crate::ipc::{ChannelDirection, ChannelMode, IpcChannel};
use crate::process::{ProcessDescriptor, ProcessHandle};
use crate::supervisor::{SupervisionPolicy, Supervisor, SupervisorOptions, SupervisorStatus};
use nix::sys::signal::Signal;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Receives inbound messages on the listener thread.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: Value);
}

impl<F> MessageHandler for F
where
    F: Fn(Value) + Send + Sync + 'static,
{
    fn on_message(&self, message: Value) {
        self(message)
    }
}

/// One end of a managed service.
pub struct ManagedDaemon {
    alias: String,
    inbound: Arc<IpcChannel>,
    outbound: IpcChannel,
    listener: Option<JoinHandle<()>>,
    supervisor: Option<Supervisor>,
}

impl ManagedDaemon {
    /// Start supervising a program and open the supervisor end of its channels.
    ///
    /// A failed first start is not an error; the supervisor keeps retrying
    /// per `policy`.
    pub fn supervise(
        ctx: &RuntimeContext,
        alias: &str,
        descriptor: ProcessDescriptor,
        policy: Arc<dyn SupervisionPolicy>,
        options: SupervisorOptions,
        handler: impl MessageHandler,
    ) -> Result<Self> {
        let mut daemon = Self::open(
            ctx,
            alias,
            ChannelDirection::ToSupervisor,
            ChannelDirection::ToSupervisee,
            handler,
        )?;

        let handle = Arc::new(ProcessHandle::new(ctx, descriptor));
        if !handle.execute() {
            warn!("Initial start of {} failed; the supervisor will retry", alias);
        }

        let supervisor = Supervisor::new(ctx, handle, policy, options);
        if !supervisor.monitor() {
            return Err(ProcwardError::Other(format!(
                "Failed to start supervisor for {}",
                alias
            )));
        }
        daemon.supervisor = Some(supervisor);
        Ok(daemon)
    }

    /// Open the supervisee end, from inside the supervised program.
    pub fn attach(ctx: &RuntimeContext, alias: &str, handler: impl MessageHandler) -> Result<Self> {
        Self::open(
            ctx,
            alias,
            ChannelDirection::ToSupervisee,
            ChannelDirection::ToSupervisor,
            handler,
        )
    }

    fn open(
        ctx: &RuntimeContext,
        alias: &str,
        inbound: ChannelDirection,
        outbound: ChannelDirection,
        handler: impl MessageHandler,
    ) -> Result<Self> {
        let inbound = Arc::new(IpcChannel::open(
            ctx.channel_path(alias, inbound),
            ChannelMode::Reader,
        )?);
        let outbound = IpcChannel::open(ctx.channel_path(alias, outbound), ChannelMode::Writer)?;

        let reader = Arc::clone(&inbound);
        let listener = thread::Builder::new()
            .name(format!("listener-{}", alias))
            .spawn(move || listen(&reader, &handler))
            .map_err(|e| ProcwardError::Other(format!("Failed to spawn listener: {}", e)))?;

        info!("Opened control channels for {}", alias);
        Ok(Self {
            alias: alias.to_string(),
            inbound,
            outbound,
            listener: Some(listener),
            supervisor: None,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Send one JSON message to the other end without blocking.
    pub fn send(&self, message: &Value) -> bool {
        self.outbound.write_json(message, false)
    }

    /// The supervisor, on the supervisor end.
    pub fn supervisor(&self) -> Option<&Supervisor> {
        self.supervisor.as_ref()
    }

    pub fn status(&self) -> Option<SupervisorStatus> {
        self.supervisor.as_ref().map(Supervisor::status)
    }

    /// Stop supervising and stop the child process.
    ///
    /// Returns `true` on the supervisee end, where there is nothing to stop.
    pub fn shut_down(&self) -> bool {
        match self.supervisor {
            Some(ref supervisor) => {
                supervisor.unmonitor();
                supervisor.handle().shut_down(Signal::SIGTERM)
            }
            None => true,
        }
    }
}

fn listen(channel: &IpcChannel, handler: &dyn MessageHandler) {
    loop {
        let message = match channel.receive(true) {
            Ok(message) => message,
            Err(e) if e.is_queue_removed() => break,
            Err(e) => {
                warn!("Listener on {} skipped a message: {}", channel.path().display(), e);
                thread::sleep(IpcConfig::RETRY_INTERVAL);
                continue;
            }
        };

        match message.decode_json::<Value>() {
            Ok(value) => {
                if panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(value))).is_err() {
                    error!("Message handler panicked on {}", channel.path().display());
                }
            }
            Err(e) => warn!(
                "Discarding undecodable message on {}: {}",
                channel.path().display(),
                e
            ),
        }
    }
    debug!("Listener on {} exiting", channel.path().display());
}

impl Drop for ManagedDaemon {
    fn drop(&mut self) {
        // Closing the reader wakes the blocked listener before we join it.
        self.inbound.close();
        self.outbound.close();
        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                error!("Listener thread for {} panicked", self.alias);
            }
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.unmonitor();
        }
        debug!("Closed control channels for {}", self.alias);
    }
}

impl std::fmt::Debug for ManagedDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedDaemon")
            .field("alias", &self.alias)
            .field("supervised", &self.supervisor.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_attach_pair_exchanges_messages() {
        let dir = TempDir::new().unwrap();
        let ctx = RuntimeContext::new(dir.path()).unwrap();

        // Play the supervisor end with raw channels.
        let (tx, rx) = mpsc::channel();
        let daemon = ManagedDaemon::attach(&ctx, "unit", move |value: Value| {
            let _ = tx.send(value);
        })
        .unwrap();

        let down = IpcChannel::open(
            ctx.channel_path("unit", ChannelDirection::ToSupervisee),
            ChannelMode::Writer,
        )
        .unwrap();
        let up = IpcChannel::open(
            ctx.channel_path("unit", ChannelDirection::ToSupervisor),
            ChannelMode::Reader,
        )
        .unwrap();

        assert!(down.write_json(&json!({"cmd": "ping"}), false));
        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, json!({"cmd": "ping"}));

        assert!(daemon.send(&json!({"reply": "pong"})));
        assert_eq!(up.read_json::<Value>(false), Some(json!({"reply": "pong"})));
        assert!(daemon.status().is_none());
        assert!(daemon.shut_down());
    }

    #[test]
    fn test_drop_unblocks_listener() {
        let dir = TempDir::new().unwrap();
        let ctx = RuntimeContext::new(dir.path()).unwrap();
        let daemon = ManagedDaemon::attach(&ctx, "idle", |_value: Value| {}).unwrap();

        // Let the listener block in its read.
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        drop(daemon);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_malformed_message_does_not_stop_listener() {
        let dir = TempDir::new().unwrap();
        let ctx = RuntimeContext::new(dir.path()).unwrap();
        let (tx, rx) = mpsc::channel();
        let _daemon = ManagedDaemon::attach(&ctx, "robust", move |value: Value| {
            let _ = tx.send(value);
        })
        .unwrap();

        let down = IpcChannel::open(
            ctx.channel_path("robust", ChannelDirection::ToSupervisee),
            ChannelMode::Writer,
        )
        .unwrap();
        assert!(down.write(
            &crate::ipc::IpcMessage::new(crate::config::IpcConfig::JSON_TAG, b"{oops".to_vec()),
            false
        ));
        assert!(down.write_json(&json!(42), false));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), json!(42));
    }

    #[test]
    fn test_truncated_entry_does_not_stop_listener() {
        let dir = TempDir::new().unwrap();
        let ctx = RuntimeContext::new(dir.path()).unwrap();
        let (tx, rx) = mpsc::channel();
        let _daemon = ManagedDaemon::attach(&ctx, "short", move |value: Value| {
            let _ = tx.send(value);
        })
        .unwrap();

        let path = ctx.channel_path("short", ChannelDirection::ToSupervisee);
        crate::ipc::send_raw_text(crate::ipc::queue_key(&path), &[0, 1, 2, 3]).unwrap();

        let down = IpcChannel::open(&path, ChannelMode::Writer).unwrap();
        assert!(down.write_json(&json!(42), false));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), json!(42));
    }
}
