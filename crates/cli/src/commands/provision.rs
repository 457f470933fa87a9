//! Provision Command

use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::PathBuf;
use tracing::{error, info};

use testbed_common::ProvisionerKind;
use testbed_provision::{
    provisioner_from_config, ProvisionRunner, ResourceLedger, RetryPolicy, RunContext, TestState,
};

use super::{interruptible_root, Env};
use crate::output::{print_list, print_success};

#[derive(Args)]
pub struct ProvisionArgs {
    /// Provisioner to use (overrides configuration)
    #[arg(long, env = "TESTBED_PROVISIONER")]
    provisioner: Option<ProvisionerKind>,

    /// Number of nodes (overrides configuration)
    #[arg(long)]
    nodes: Option<usize>,

    /// Run id used in the resource tag (generated if omitted)
    #[arg(long, env = "TESTBED_RUN_ID")]
    run_id: Option<String>,

    /// Provisioner state directory (overrides configuration)
    #[arg(long, env = "TESTBED_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

pub async fn execute(args: ProvisionArgs, mut env: Env) -> Result<()> {
    if let Some(kind) = args.provisioner {
        env.config.provisioner = Some(kind);
    }
    if let Some(nodes) = args.nodes {
        env.config.onprem.nodes = nodes;
    }
    if args.run_id.is_some() {
        env.config.run_id = args.run_id;
    }
    if let Some(dir) = args.state_dir {
        env.config.state_dir = dir;
    }
    if env.config.provisioner.is_none() {
        bail!("no provisioner configured, pass --provisioner or set it in the configuration");
    }

    let config = env.config.with_run_id();
    config.validate()?;

    if let Some(existing) = TestState::load_optional(&env.state_file)? {
        bail!(
            "state file {} already describes cluster {}, destroy it first",
            env.state_file.display(),
            existing.tag
        );
    }

    let tag = config.tag();
    let provisioner = provisioner_from_config(&config, &tag)?;
    let ledger = ResourceLedger::from_policy(&config.policy)?;
    let runner = ProvisionRunner::new(RetryPolicy::from(&config.retry), ledger.clone());

    let root = interruptible_root();
    let ctx = root.with_timeout(config.test_timeout());
    info!(tag = %tag, provisioner = %provisioner.kind(), "provisioning cluster");
    let provisioned = runner.create(&ctx, provisioner, &tag).await?;

    let state = TestState::new(provisioned.provisioner.as_ref(), &config.state_dir, &tag);
    if let Err(err) = state.save(&env.state_file) {
        // nothing could destroy the cluster later without its state
        error!(tag = %tag, error = %err, "failed to save state, destroying cluster");
        let cleanup = RunContext::detached(config.retry.finalize_timeout());
        provisioned
            .provisioner
            .destroy(&cleanup)
            .await
            .with_context(|| format!("destroying {} after state save failure", tag))?;
        ledger.deallocate(&tag)?;
        return Err(err.into());
    }

    print_list(&provisioned.nodes, env.format);
    print_success(&format!(
        "Provisioned {} node(s) as {} (state in {})",
        provisioned.nodes.len(),
        tag,
        env.state_file.display()
    ));
    Ok(())
}
