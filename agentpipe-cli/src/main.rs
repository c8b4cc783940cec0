//! CLI for agentpipe: relay stdin/stdout over a named pipe endpoint.

#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

#[cfg(unix)]
mod relay;

use std::path::PathBuf;
use std::time::Duration;

use agentpipe::PipeConfig;
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "agentpipe",
    version,
    about = "Relay stdin/stdout over a non-blocking local pipe"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log filter (e.g. `warn`, `agentpipe=debug`). Logs go to stderr.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a listening peer and relay.
    Connect(PipeArgs),

    /// Listen for one peer, then relay.
    Listen(PipeArgs),
}

/// Options shared by both subcommands.
#[derive(clap::Args)]
struct PipeArgs {
    /// Socket path of the pipe.
    path: PathBuf,

    /// Stop reading once this many received bytes are waiting for stdout.
    #[arg(long, default_value_t = agentpipe::DEFAULT_READ_BUFFER_SIZE)]
    read_buffer_size: usize,

    /// Seconds `listen` waits for a peer before aborting.
    #[arg(long, default_value_t = 30)]
    accept_timeout_secs: u64,

    /// Seconds a synchronous write may take before aborting.
    #[arg(long, default_value_t = 30)]
    write_timeout_secs: u64,
}

impl PipeArgs {
    fn config(&self) -> PipeConfig {
        PipeConfig::new()
            .read_buffer_size(self.read_buffer_size)
            .accept_timeout(Duration::from_secs(self.accept_timeout_secs))
            .write_timeout(Duration::from_secs(self.write_timeout_secs))
    }
}

fn init_logging(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(not(unix))]
fn main() {
    eprintln!("agentpipe only runs on Unix");
    std::process::exit(1);
}

#[cfg(unix)]
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Command::Connect(args) => relay::connect(&args.path, args.config()),
        Command::Listen(args) => relay::listen(&args.path, args.config()),
    }
}
