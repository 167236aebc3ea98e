//! Procward - supervise a service and talk to it over its control channels.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use procward_core::config::IpcConfig;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "procward")]
#[command(about = "Self-healing process supervisor")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the service described by a JSON file until Ctrl-C
    Run {
        /// Service configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Send one JSON message to a running supervisor
    Send {
        /// Directory holding the control channels
        #[arg(long, default_value = IpcConfig::DEFAULT_RUN_DIR)]
        run_dir: PathBuf,

        /// Service alias
        #[arg(short, long)]
        alias: String,

        /// Message body, as JSON
        #[arg(short, long)]
        json: String,
    },

    /// Count running processes with a given name
    Scan {
        /// Process name as the process table reports it
        #[arg(short, long)]
        name: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Run { config } => commands::run(&config),
        Command::Send {
            run_dir,
            alias,
            json,
        } => commands::send(&run_dir, &alias, &json),
        Command::Scan { name } => commands::scan(&name),
    }
}
