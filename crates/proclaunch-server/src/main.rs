//! proclaunch launcher - runs child processes on behalf of one client.
//!
//! The client creates a Unix socket, spawns this binary with the socket path
//! as its only argument and waits for the connection. The launcher then
//! serves start/write/stop commands until it receives `Shutdown` or the
//! connection goes away.
//!
//! Exit codes: `0` once the connection ended for any reason, `1` on bad
//! arguments or when the socket cannot be reached.

use anyhow::{Context, Result};
use clap::Parser;
use proclaunch::ExitReason;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "proclaunch-server")]
#[command(about = "Process launcher serving one proclaunch client")]
struct Args {
    /// Path of the Unix socket the client is listening on
    socket: PathBuf,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Help and version go to stdout and are not failures.
            let failed = e.use_stderr();
            let _ = e.print();
            return if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging(args.debug);
    info!("Starting launcher (pid {})", std::process::id());

    match run(&args.socket).await {
        Ok(ExitReason::ProtocolError) => {
            error!("Launcher stopped after a protocol error");
            ExitCode::SUCCESS
        }
        Ok(reason) => {
            info!("Launcher exiting ({:?})", reason);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; the client relays them into its own log.
fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

#[cfg(unix)]
async fn run(socket: &Path) -> Result<ExitReason> {
    proclaunch::server::serve_unix(socket)
        .await
        .with_context(|| format!("Failed to serve client at {}", socket.display()))
}

#[cfg(not(unix))]
async fn run(socket: &Path) -> Result<ExitReason> {
    anyhow::bail!(
        "Unix domain sockets are not available, cannot serve {}",
        socket.display()
    )
}
