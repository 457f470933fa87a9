//! Diagnostic log collection
//!
//! Teardown asks a [`LogCollector`] for postmortem logs before destroying
//! nodes. Collection failures are reported by the caller and never stop
//! teardown.

use async_trait::async_trait;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use testbed_common::{Error, Node, Result, TestbedConfig};

use crate::context::RunContext;
use crate::process::{run_tool, ToolCommand, DEFAULT_GRACE};

/// Gathers diagnostic data from nodes
#[async_trait]
pub trait LogCollector: Send + Sync {
    async fn collect_logs(&self, ctx: &RunContext, label: &str, nodes: &[Node]) -> Result<()>;
}

/// Collector that does nothing, for runs without a report directory
pub struct NoopLogCollector;

#[async_trait]
impl LogCollector for NoopLogCollector {
    async fn collect_logs(&self, _ctx: &RunContext, label: &str, nodes: &[Node]) -> Result<()> {
        debug!(label, nodes = nodes.len(), "log collection disabled");
        Ok(())
    }
}

/// Runs a command on every node over ssh and stores its output
///
/// Output of node `n` lands in `<report_dir>/<label>/<n>.log`.
pub struct CommandLogCollector {
    report_dir: PathBuf,
    command: String,
    connect_timeout: Duration,
    grace: Duration,
    binary: String,
}

impl CommandLogCollector {
    pub fn new(report_dir: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            report_dir: report_dir.into(),
            command: command.into(),
            connect_timeout: Duration::from_secs(30),
            grace: DEFAULT_GRACE,
            binary: "ssh".to_string(),
        }
    }

    pub fn from_config(config: &TestbedConfig) -> Self {
        let mut collector = Self::new(&config.report_dir, &config.log_command);
        collector.grace = config.retry.tool_grace();
        collector
    }

    /// Use a different ssh client binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn ssh_command(&self, node: &Node) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.binary)
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "BatchMode=yes",
                "-o",
            ])
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg("-p")
            .arg(node.ssh_port.to_string())
            .grace(self.grace);
        if let Some(key) = &node.ssh_key_path {
            cmd = cmd.arg("-i").arg(key.to_string_lossy());
        }
        cmd.arg(format!("{}@{}", node.ssh_user, node.public_addr))
            .arg(&self.command)
    }

    async fn collect_node(&self, ctx: &RunContext, dir: &Path, node: &Node) -> Result<()> {
        let out = run_tool(ctx, self.ssh_command(node)).await?;
        let path = dir.join(format!("{}.log", node_log_name(node)));
        tokio::fs::write(&path, &out.stdout).await?;
        debug!(node = %node, path = %path.display(), "node logs saved");
        Ok(())
    }
}

#[async_trait]
impl LogCollector for CommandLogCollector {
    async fn collect_logs(&self, ctx: &RunContext, label: &str, nodes: &[Node]) -> Result<()> {
        let dir = self.report_dir.join(label);
        tokio::fs::create_dir_all(&dir).await?;
        info!(label, nodes = nodes.len(), dir = %dir.display(), "collecting logs");

        let dir = dir.as_path();
        let results = join_all(nodes.iter().map(|node| async move {
            self.collect_node(ctx, dir, node)
                .await
                .map_err(|e| Error::LogCollection(format!("{}: {}", node, e)))
        }))
        .await;

        match Error::aggregate(results.into_iter().map(Result::err)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// File name for a node's log: its address, plus the port when it is not
/// the default one (vagrant nodes share the loopback address)
fn node_log_name(node: &Node) -> String {
    let addr = if node.private_addr.is_empty() {
        &node.public_addr
    } else {
        &node.private_addr
    };
    let name: String = addr
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    if node.ssh_port == 22 {
        name
    } else {
        format!("{}_{}", name, node.ssh_port)
    }
}
