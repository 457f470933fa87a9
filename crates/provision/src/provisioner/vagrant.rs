//! Vagrant-backed provisioner for local virtual machines

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use testbed_common::{Error, Node, ProvisionerKind, Result, TestbedConfig};

use super::{copy_script, Provisioner, ProvisionerState};
use crate::context::RunContext;
use crate::process::{run_tool, ToolCommand};

/// Vagrant backend parameters
#[derive(Debug, Clone)]
pub struct VagrantConfig {
    /// Vagrantfile or directory containing one
    pub script_path: PathBuf,
    pub installer_url: String,
    pub nodes: usize,
    pub os: String,
    pub grace: Duration,
    pub binary: String,
}

impl VagrantConfig {
    pub fn from_testbed(config: &TestbedConfig) -> Result<Self> {
        let vg = Self {
            script_path: config.onprem.script_path.clone(),
            installer_url: config.onprem.installer_url.clone(),
            nodes: config.onprem.nodes,
            os: config.onprem.os.clone(),
            grace: config.retry.tool_grace(),
            binary: "vagrant".to_string(),
        };
        vg.validate()?;
        Ok(vg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            return Err(Error::InvalidConfig("node count must be positive".to_string()));
        }
        if self.script_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("script_path is required for vagrant".to_string()));
        }
        Ok(())
    }
}

/// Vagrant provisioner bound to one working directory
pub struct VagrantProvisioner {
    dir: PathBuf,
    config: VagrantConfig,
    nodes: RwLock<Vec<Node>>,
}

impl VagrantProvisioner {
    pub fn new(dir: PathBuf, config: VagrantConfig) -> Self {
        Self {
            dir,
            config,
            nodes: RwLock::new(Vec::new()),
        }
    }

    /// Rebind to boxes created by an earlier process
    pub fn from_state(config: VagrantConfig, state: ProvisionerState) -> Self {
        Self {
            dir: state.dir,
            config,
            nodes: RwLock::new(state.nodes),
        }
    }

    fn command(&self) -> ToolCommand {
        ToolCommand::new(&self.config.binary)
            .current_dir(&self.dir)
            .env("VAGRANT_NODES", self.config.nodes.to_string())
            .env("VAGRANT_INSTALLER_URL", &self.config.installer_url)
            .env("VAGRANT_OS", &self.config.os)
            .grace(self.config.grace)
    }
}

#[async_trait]
impl Provisioner for VagrantProvisioner {
    fn kind(&self) -> ProvisionerKind {
        ProvisionerKind::Vagrant
    }

    async fn create(&self, ctx: &RunContext) -> Result<Vec<Node>> {
        info!(dir = %self.dir.display(), nodes = self.config.nodes, "vagrant up");
        copy_script(&self.config.script_path, &self.dir).await?;

        run_tool(ctx, self.command().args(["up", "--no-color"])).await?;
        let out = run_tool(ctx, self.command().arg("ssh-config")).await?;

        let nodes = parse_ssh_config(&out.stdout_text());
        if nodes.is_empty() {
            return Err(Error::InvalidState(
                "vagrant ssh-config listed no machines".to_string(),
            ));
        }
        *self.nodes.write() = nodes.clone();
        Ok(nodes)
    }

    async fn destroy(&self, ctx: &RunContext) -> Result<()> {
        if !self.dir.exists() {
            info!(dir = %self.dir.display(), "no vagrant state, nothing to destroy");
            return Ok(());
        }

        info!(dir = %self.dir.display(), "vagrant destroy");
        run_tool(ctx, self.command().args(["destroy", "-f"])).await?;
        self.nodes.write().clear();
        Ok(())
    }

    fn node_pool(&self) -> Vec<Node> {
        self.nodes.read().clone()
    }

    fn state(&self) -> ProvisionerState {
        let nodes = self.node_pool();
        ProvisionerState {
            dir: self.dir.clone(),
            installer_addr: nodes.first().map(|n| n.public_addr.clone()),
            nodes,
        }
    }
}

/// Parse `vagrant ssh-config` output into nodes
///
/// The private address is the machine name, as vagrant only knows the
/// forwarded endpoint.
pub fn parse_ssh_config(text: &str) -> Vec<Node> {
    let mut nodes = Vec::new();
    let mut current: Option<Node> = None;

    for line in text.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let value = value.trim().trim_matches('"');

        match key {
            "Host" => {
                nodes.extend(current.take());
                current = Some(Node::new("", value).with_ssh("vagrant", None));
            }
            "HostName" => {
                if let Some(node) = current.as_mut() {
                    node.public_addr = value.to_string();
                }
            }
            "User" => {
                if let Some(node) = current.as_mut() {
                    node.ssh_user = value.to_string();
                }
            }
            "Port" => {
                if let (Some(node), Ok(port)) = (current.as_mut(), value.parse()) {
                    node.ssh_port = port;
                }
            }
            "IdentityFile" => {
                if let Some(node) = current.as_mut() {
                    node.ssh_key_path = Some(PathBuf::from(value));
                }
            }
            _ => {}
        }
    }
    nodes.extend(current);
    nodes.retain(|n| !n.public_addr.is_empty());
    nodes
}
