//! watchd - QA log-history daemon.
//!
//! Main entry point: serve the aggregation API, supervise a worker 24/7,
//! or reset stale lock/queue state.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use watchd::supervisor::Supervisor;
use watchd::{default_config_path, load_config, recover_stale_state, Daemon};

#[derive(Parser)]
#[command(name = "watchd", about = "QA log-history and supervision daemon", version)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, env = "WATCHD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the API/worker port
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the aggregation API server (default)
    Serve,
    /// Keep the worker alive 24/7, restarting it on crash
    Supervise,
    /// Reclaim stale locks, reset the queue, and exit
    ResetLocks,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = match load_config(&config_path, cli.port) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // Run the async main.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let exit_code = runtime.block_on(async {
        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone());

        match cli.command.unwrap_or(Command::Serve) {
            Command::Serve => {
                let daemon = Daemon::new(config);
                match daemon.run(cancel).await {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("daemon error: {}", e);
                        1
                    }
                }
            }
            Command::Supervise => {
                // A crash mid-run must not wedge the next one.
                if let Err(e) = recover_stale_state(&config) {
                    error!("startup recovery failed: {}", e);
                    return 1;
                }
                let mut supervisor = Supervisor::new(config.supervisor.clone());
                match supervisor.run(cancel).await {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("supervisor error: {}", e);
                        1
                    }
                }
            }
            Command::ResetLocks => match recover_stale_state(&config) {
                Ok(reclaimed) => {
                    info!("reclaimed {} stale lock(s)", reclaimed.len());
                    0
                }
                Err(e) => {
                    error!("reset failed: {}", e);
                    1
                }
            },
        }
    });

    std::process::exit(exit_code);
}

/// Translate SIGINT/SIGTERM into cancellation for a graceful shutdown.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

            tokio::select! {
                _ = sigint.recv() => {
                    info!("received SIGINT, initiating graceful shutdown");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to register ctrl-c handler");
            info!("received ctrl-c, initiating graceful shutdown");
        }

        cancel.cancel();
    });
}
