//! Leaked Command

use anyhow::{bail, Result};
use clap::Args;
use std::path::PathBuf;

use testbed_provision::ResourceLedger;

use super::Env;
use crate::output::{print_list, print_warning, TagDisplay};

#[derive(Args)]
pub struct LeakedArgs {
    /// Ledger file (defaults to policy.resource_list_file)
    #[arg(long)]
    file: Option<PathBuf>,
}

pub async fn execute(args: LeakedArgs, env: Env) -> Result<()> {
    let Some(path) = args.file.or(env.config.policy.resource_list_file) else {
        bail!("no ledger file configured, pass --file or set policy.resource_list_file");
    };

    let tags = if path.exists() {
        ResourceLedger::read_file(&path)?
    } else {
        Default::default()
    };

    let items: Vec<TagDisplay> = tags.into_iter().map(|tag| TagDisplay { tag }).collect();
    if !items.is_empty() {
        print_warning(&format!(
            "{} tag(s) in {} have not been destroyed",
            items.len(),
            path.display()
        ));
    }
    print_list(&items, env.format);
    Ok(())
}
