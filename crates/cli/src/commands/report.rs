//! Report Command

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use testbed_provision::{CommandLogCollector, LogCollector, TestState};

use super::{interruptible_root, Env};
use crate::output::print_success;

#[derive(Args)]
pub struct ReportArgs {
    /// Subdirectory of the report directory to write logs to
    #[arg(long, default_value = "report")]
    label: String,

    /// Report directory (overrides configuration)
    #[arg(long, env = "TESTBED_REPORT_DIR")]
    report_dir: Option<PathBuf>,
}

pub async fn execute(args: ReportArgs, mut env: Env) -> Result<()> {
    if let Some(dir) = args.report_dir {
        env.config.report_dir = dir;
    }
    let state = TestState::load(&env.state_file)
        .with_context(|| format!("reading state file {}", env.state_file.display()))?;

    let collector = CommandLogCollector::from_config(&env.config);
    let ctx = interruptible_root().with_timeout(env.config.retry.finalize_timeout());
    collector
        .collect_logs(&ctx, &args.label, &state.provisioner_state.nodes)
        .await
        .with_context(|| format!("collecting logs from {}", state.tag))?;

    print_success(&format!(
        "Logs of {} node(s) written to {}",
        state.provisioner_state.nodes.len(),
        env.config.report_dir.join(&args.label).display()
    ));
    Ok(())
}
