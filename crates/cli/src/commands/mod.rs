//! CLI Commands

pub mod destroy;
pub mod leaked;
pub mod provision;
pub mod report;
pub mod status;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use testbed_common::TestbedConfig;
use testbed_provision::RunContext;

use crate::output::OutputFormat;

/// Settings shared by every command
pub struct Env {
    pub config: TestbedConfig,
    pub state_file: PathBuf,
    pub format: OutputFormat,
}

impl Env {
    pub fn load(config_path: &Path, state_file: Option<PathBuf>, format: OutputFormat) -> Result<Self> {
        let config = TestbedConfig::load(config_path)
            .with_context(|| format!("loading configuration from {}", config_path.display()))?;
        debug!(config = ?config.redacted(), "configuration loaded");

        let state_file = state_file.unwrap_or_else(|| config.state_file());
        Ok(Self {
            config,
            state_file,
            format,
        })
    }
}

/// Root context cancelled on Ctrl+C
///
/// A second Ctrl+C exits immediately, skipping cleanup.
pub fn interruptible_root() -> RunContext {
    let root = RunContext::background();
    let handle = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupted, cleaning up (press Ctrl+C again to abort)");
        handle.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("aborted, resources may be left behind");
            std::process::exit(130);
        }
    });
    root
}
