//! Subcommand implementations.

use anyhow::{bail, Context, Result};
use procward_core::process::ProcessTable;
use procward_core::{
    Action, ChannelDirection, ChannelMode, IpcChannel, ManagedDaemon, RuntimeContext,
    ServiceConfig,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, error, info};

/// How often `run` logs the supervisor status.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

enum Event {
    Interrupted,
    SupervisionEnded(Action),
}

/// Supervise one service until Ctrl-C or until its policy gives up.
pub fn run(config_path: &Path) -> Result<()> {
    let config = ServiceConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let ctx = RuntimeContext::new(&config.run_dir)?;

    info!("Starting procward for {} ({})", config.alias, config.name);

    let alias = config.alias.clone();
    let daemon = ManagedDaemon::supervise(
        &ctx,
        &config.alias,
        config.descriptor(),
        config.policy(),
        config.supervisor_options(),
        move |message: Value| info!("{} says: {}", alias, message),
    )?;

    let (tx, rx) = mpsc::channel();
    let interrupt_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(Event::Interrupted);
    })
    .context("Failed to install Ctrl-C handler")?;

    if let Some(supervisor) = daemon.supervisor() {
        supervisor.set_exit_hook(move |action| {
            let _ = tx.send(Event::SupervisionEnded(action));
        });
    }

    loop {
        match rx.recv_timeout(STATUS_INTERVAL) {
            Ok(Event::Interrupted) => {
                info!("Shutdown signal received, stopping {}", config.alias);
                if !daemon.shut_down() {
                    bail!("{} did not stop", config.name);
                }
                return Ok(());
            }
            Ok(Event::SupervisionEnded(action)) => {
                // The process is left as it is.
                error!("Supervision of {} ended: {:?}", config.alias, action);
                bail!("supervision of {} ended by policy ({:?})", config.alias, action);
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(status) = daemon.status() {
                    debug!("{}", serde_json::to_string(&status)?);
                }
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

/// Write one JSON message toward the supervisor end of `alias`.
pub fn send(run_dir: &Path, alias: &str, body: &str) -> Result<()> {
    let message: Value = serde_json::from_str(body).context("Message is not valid JSON")?;
    let ctx = RuntimeContext::new(run_dir)?;
    let path = ctx.channel_path(alias, ChannelDirection::ToSupervisor);

    let channel = IpcChannel::open(&path, ChannelMode::Writer)?;
    if !channel.write_json(&message, false) {
        bail!("Could not deliver message to {} ({})", alias, path.display());
    }
    info!("Sent message to {}", alias);
    Ok(())
}

/// Print instance count and first PID for `name` as JSON.
pub fn scan(name: &str) -> Result<()> {
    let table = ProcessTable::new();
    let report = json!({
        "name": name,
        "instances": table.count_instances(name),
        "first_pid": table.find_pid(name),
    });
    // Intentional stdout: the report is the command's output.
    println!("{}", report);
    Ok(())
}
