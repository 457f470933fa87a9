//! Provisioning backends
//!
//! Implements node creation and destruction for each supported backend
//! behind the [`Provisioner`] trait.

pub mod terraform;
pub mod vagrant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use testbed_common::{Error, Node, ProvisionerKind, Result, TestbedConfig};

use crate::context::RunContext;
use crate::state::TestState;

pub use terraform::{TerraformConfig, TerraformProvisioner};
pub use vagrant::{VagrantConfig, VagrantProvisioner};

/// Trait for provisioning backends
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Backend kind
    fn kind(&self) -> ProvisionerKind;

    /// Create the infrastructure and return its nodes
    async fn create(&self, ctx: &RunContext) -> Result<Vec<Node>>;

    /// Destroy everything this provisioner created
    async fn destroy(&self, ctx: &RunContext) -> Result<()>;

    /// Nodes known to this provisioner (created or restored from state)
    fn node_pool(&self) -> Vec<Node>;

    /// Snapshot of the state needed to rebind to this infrastructure
    fn state(&self) -> ProvisionerState;
}

/// Persisted backend state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerState {
    /// Backend working directory (terraform state, .vagrant)
    pub dir: PathBuf,
    /// Node inventory
    pub nodes: Vec<Node>,
    /// Address of the installer node, when one was designated
    #[serde(default)]
    pub installer_addr: Option<String>,
}

/// Create a provisioner for a new cluster
pub fn provisioner_from_config(config: &TestbedConfig, tag: &str) -> Result<Arc<dyn Provisioner>> {
    match config.provisioner {
        Some(ProvisionerKind::Terraform) => {
            let tf = TerraformConfig::from_testbed(config, tag)?;
            Ok(Arc::new(TerraformProvisioner::new(
                config.state_dir.join("tf"),
                tf,
            )))
        }
        Some(ProvisionerKind::Vagrant) => {
            let vg = VagrantConfig::from_testbed(config)?;
            Ok(Arc::new(VagrantProvisioner::new(
                config.state_dir.join("vagrant"),
                vg,
            )))
        }
        None => Err(Error::InvalidConfig(
            "no provisioner configured".to_string(),
        )),
    }
}

/// Rebind a provisioner to infrastructure recorded in `state`
///
/// The node count from configuration wins over the persisted inventory
/// size when it is set.
pub fn provisioner_from_state(config: &TestbedConfig, state: &TestState) -> Result<Arc<dyn Provisioner>> {
    state.validate()?;
    let mut config = config.clone();
    if config.onprem.nodes == 0 {
        config.onprem.nodes = state.provisioner_state.nodes.len();
    }

    match state.provisioner {
        ProvisionerKind::Terraform => {
            let tf = TerraformConfig::from_testbed(&config, &state.tag)?;
            Ok(Arc::new(TerraformProvisioner::from_state(
                tf,
                state.provisioner_state.clone(),
            )))
        }
        ProvisionerKind::Vagrant => {
            let vg = VagrantConfig::from_testbed(&config)?;
            Ok(Arc::new(VagrantProvisioner::from_state(
                vg,
                state.provisioner_state.clone(),
            )))
        }
    }
}

/// Copy a provisioner script (a single file or the top level of a
/// directory) into the working directory
pub(crate) async fn copy_script(src: &Path, dst_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dst_dir).await?;

    let meta = match tokio::fs::metadata(src).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::InvalidConfig(format!(
                "script path {} does not exist",
                src.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };

    if meta.is_file() {
        let name = src
            .file_name()
            .ok_or_else(|| Error::InvalidConfig(format!("bad script path {}", src.display())))?;
        tokio::fs::copy(src, dst_dir.join(name)).await?;
        return Ok(());
    }

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if tokio::fs::metadata(&path).await?.is_file() {
            tokio::fs::copy(&path, dst_dir.join(entry.file_name())).await?;
        }
    }
    Ok(())
}
