//! Destroy Command

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use testbed_provision::{provisioner_from_state, ResourceLedger, TestState};

use super::{interruptible_root, Env};
use crate::output::{print_info, print_success};

#[derive(Args)]
pub struct DestroyArgs {
    /// Keep the state file after destroying
    #[arg(long)]
    keep_state: bool,
}

pub async fn execute(args: DestroyArgs, env: Env) -> Result<()> {
    let Some(state) = TestState::load_optional(&env.state_file)
        .with_context(|| format!("reading state file {}", env.state_file.display()))?
    else {
        print_info(&format!(
            "No state file at {}, nothing to destroy",
            env.state_file.display()
        ));
        return Ok(());
    };

    let provisioner = provisioner_from_state(&env.config, &state)?;
    let ledger = ResourceLedger::from_policy(&env.config.policy)?;

    let ctx = interruptible_root().with_timeout(env.config.retry.finalize_timeout());

    info!(tag = %state.tag, provisioner = %state.provisioner, "destroying cluster");
    provisioner
        .destroy(&ctx)
        .await
        .with_context(|| format!("destroying cluster {}", state.tag))?;
    ledger.deallocate(&state.tag)?;

    if !args.keep_state {
        TestState::remove(&env.state_file)?;
    }
    print_success(&format!("Destroyed {}", state.tag));
    Ok(())
}
