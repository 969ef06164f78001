//! watchctl - CLI client for watchd.
//!
//! Queries the local aggregation API: modules, test cases, 7-day history,
//! manual updates, health, and log download.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use std::path::PathBuf;

/// CLI client for the watchd log-history daemon.
#[derive(Parser)]
#[command(name = "watchctl")]
#[command(about = "Query the watchd test history API")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:5001)
    #[arg(long, global = true, env = "WATCHD_ADDR")]
    addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured modules
    Modules,

    /// List test cases for a module with their last status
    Tests {
        /// Module id
        module: String,
    },

    /// Show the 7-day history for one test case
    History {
        /// Module id
        module: String,

        /// Test case name
        test_name: String,
    },

    /// Re-parse a module's log and merge it into history
    Update {
        /// Module id (omit with --all)
        module: Option<String>,

        /// Update every configured module
        #[arg(long, conflicts_with = "module")]
        all: bool,
    },

    /// Check daemon health
    Health,

    /// Download a module's raw log file
    DownloadLog {
        /// Module id
        module: String,

        /// Output path (defaults to the server-provided filename)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:5001".to_string());
    let client = Client::new(&addr);

    // Wait for the daemon before issuing the actual request; the supervisor
    // may still be bringing it up.
    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Modules => run_modules(&client).await,
        Command::Tests { module } => run_tests(&client, &module).await,
        Command::History { module, test_name } => run_history(&client, &module, &test_name).await,
        Command::Update { module, all } => run_update(&client, module.as_deref(), all).await,
        Command::Health => run_health(&client).await,
        Command::DownloadLog { module, output } => {
            run_download_log(&client, &module, output).await
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run_modules(client: &Client) -> Result<(), ClientError> {
    let modules = client.modules().await?;
    render::print_modules(&modules);
    Ok(())
}

async fn run_tests(client: &Client, module: &str) -> Result<(), ClientError> {
    let cases = client.test_cases(module).await?;
    render::print_test_cases(module, &cases);
    Ok(())
}

async fn run_history(client: &Client, module: &str, test_name: &str) -> Result<(), ClientError> {
    let response = client.history(module, test_name).await?;
    render::print_history(test_name, &response);
    Ok(())
}

async fn run_update(client: &Client, module: Option<&str>, all: bool) -> Result<(), ClientError> {
    if all {
        let results = client.update_all().await?;
        println!("{}", serde_json::to_string_pretty(&results).unwrap_or_default());
        return Ok(());
    }

    let Some(module) = module else {
        eprintln!("error: provide a module id or --all");
        std::process::exit(2);
    };

    let response = client.update(module).await?;
    render::print_update(module, &response);
    Ok(())
}

async fn run_health(client: &Client) -> Result<(), ClientError> {
    let health = client.health().await?;
    render::print_health(&health);
    Ok(())
}

async fn run_download_log(
    client: &Client,
    module: &str,
    output: Option<PathBuf>,
) -> Result<(), ClientError> {
    let (filename, bytes) = client.download_log(module).await?;
    let path = output.unwrap_or_else(|| PathBuf::from(&filename));
    std::fs::write(&path, &bytes)?;
    println!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}
