//! testbed CLI - Main Entry Point
//!
//! Provisions clusters for installer end-to-end tests, tears them down and
//! reports on leaked resources.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod output;

use commands::{destroy, leaked, provision, report, status, Env};

/// testbed - infrastructure for installer end-to-end tests
#[derive(Parser)]
#[command(name = "testbed")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "TESTBED_CONFIG", default_value = "testbed.toml", global = true)]
    config: PathBuf,

    /// Test state file (defaults to <state_dir>/state.json)
    #[arg(long, env = "TESTBED_STATE_FILE", global = true)]
    state_file: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable debug logging
    #[arg(short, long, env = "TESTBED_DEBUG", global = true)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, env = "TESTBED_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a cluster and record it in the state file
    Provision(provision::ProvisionArgs),

    /// Destroy the cluster recorded in the state file
    Destroy(destroy::DestroyArgs),

    /// Collect logs from the cluster recorded in the state file
    Report(report::ReportArgs),

    /// Show the cluster recorded in the state file
    Status,

    /// List resource tags that were never destroyed
    Leaked(leaked::LeakedArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(cli.log_json.then(|| fmt::layer().json()))
        .with((!cli.log_json).then(|| fmt::layer().with_target(false)))
        .with(filter)
        .init();

    let env = Env::load(&cli.config, cli.state_file, cli.format)?;

    match cli.command {
        Commands::Provision(args) => provision::execute(args, env).await?,
        Commands::Destroy(args) => destroy::execute(args, env).await?,
        Commands::Report(args) => report::execute(args, env).await?,
        Commands::Status => status::execute(env).await?,
        Commands::Leaked(args) => leaked::execute(args, env).await?,
    }

    Ok(())
}
