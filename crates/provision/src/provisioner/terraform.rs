//! Terraform-backed provisioner
//!
//! Runs a terraform module from a dedicated working directory. The module is
//! expected to expose `public_ips` and `private_ips` list outputs.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use testbed_common::config::{AwsConfig, AzureConfig};
use testbed_common::{Error, Node, ProvisionerKind, Result, TestbedConfig};

use super::{copy_script, Provisioner, ProvisionerState};
use crate::context::RunContext;
use crate::process::{run_tool, ToolCommand};

const TFVARS_FILE: &str = "terraform.tfvars.json";

/// Terraform backend parameters
#[derive(Debug, Clone)]
pub struct TerraformConfig {
    /// Terraform module to apply
    pub script_path: PathBuf,
    pub installer_url: String,
    pub nodes: usize,
    pub os: String,
    pub docker_device: String,
    /// aws | azure
    pub cloud_provider: String,
    /// Resource tag applied to every cloud resource
    pub tag: String,
    pub aws: Option<AwsConfig>,
    pub azure: Option<AzureConfig>,
    /// Grace period for an interrupted terraform
    pub grace: Duration,
    /// Terraform binary
    pub binary: String,
}

impl TerraformConfig {
    pub fn from_testbed(config: &TestbedConfig, tag: &str) -> Result<Self> {
        let cloud_provider = config.cloud_provider.clone().ok_or_else(|| {
            Error::InvalidConfig("cloud_provider parameter is required for terraform".to_string())
        })?;

        let tf = Self {
            script_path: config.onprem.script_path.clone(),
            installer_url: config.onprem.installer_url.clone(),
            nodes: config.onprem.nodes,
            os: config.onprem.os.clone(),
            docker_device: config.onprem.docker_device.clone(),
            cloud_provider,
            tag: tag.to_string(),
            aws: config.aws.clone(),
            azure: config.azure.clone(),
            grace: config.retry.tool_grace(),
            binary: "terraform".to_string(),
        };
        tf.validate()?;
        Ok(tf)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.nodes == 0 {
            errors.push(Some(Error::InvalidConfig("node count must be positive".to_string())));
        }
        if self.os.is_empty() {
            errors.push(Some(Error::InvalidConfig("OS flavor is required".to_string())));
        }
        match self.cloud_provider.as_str() {
            "aws" if self.aws.is_none() => {
                errors.push(Some(Error::InvalidConfig("aws section is required".to_string())))
            }
            "azure" if self.azure.is_none() => {
                errors.push(Some(Error::InvalidConfig("azure section is required".to_string())))
            }
            "aws" | "azure" => {}
            other => errors.push(Some(Error::InvalidConfig(format!(
                "unsupported cloud provider {:?}",
                other
            )))),
        }
        match Error::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ssh_user(&self) -> String {
        let configured = match self.cloud_provider.as_str() {
            "azure" => self.azure.as_ref().and_then(|a| a.ssh_user.clone()),
            _ => self.aws.as_ref().and_then(|a| a.ssh_user.clone()),
        };
        configured.unwrap_or_else(|| default_user(&self.os).to_string())
    }

    fn ssh_key_path(&self) -> Option<PathBuf> {
        match self.cloud_provider.as_str() {
            "azure" => self.azure.as_ref().and_then(|a| a.ssh_key_path.clone()),
            _ => self.aws.as_ref().and_then(|a| a.ssh_key_path.clone()),
        }
    }

    /// Module variables, written as `terraform.tfvars.json`
    fn variables(&self) -> TerraformVars {
        let aws = self.aws.as_ref();
        let azure = self.azure.as_ref();
        TerraformVars {
            nodes: self.nodes,
            os: self.os.clone(),
            installer_url: self.installer_url.clone(),
            docker_device: self.docker_device.clone(),
            cluster_tag: self.tag.clone(),
            region: aws.map(|a| a.region.clone()).filter(|s| !s.is_empty()),
            key_pair: aws.map(|a| a.key_pair.clone()).filter(|s| !s.is_empty()),
            instance_type: aws
                .map(|a| a.instance_type.clone())
                .or_else(|| azure.map(|a| a.vm_type.clone()))
                .filter(|s| !s.is_empty()),
            resource_group: azure.map(|a| a.resource_group.clone()).filter(|s| !s.is_empty()),
            location: azure.map(|a| a.location.clone()).filter(|s| !s.is_empty()),
        }
    }

    /// Credentials go through the environment so they never land on disk
    fn credentials(&self) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        if let Some(aws) = &self.aws {
            if !aws.access_key.is_empty() {
                env.push(("AWS_ACCESS_KEY_ID", aws.access_key.clone()));
            }
            if !aws.secret_key.is_empty() {
                env.push(("AWS_SECRET_ACCESS_KEY", aws.secret_key.clone()));
            }
        }
        if let Some(azure) = &self.azure {
            env.push(("ARM_SUBSCRIPTION_ID", azure.subscription_id.clone()));
            env.push(("ARM_CLIENT_ID", azure.client_id.clone()));
            env.push(("ARM_CLIENT_SECRET", azure.client_secret.clone()));
            env.push(("ARM_TENANT_ID", azure.tenant_id.clone()));
        }
        env
    }
}

#[derive(Debug, Serialize)]
struct TerraformVars {
    nodes: usize,
    os: String,
    installer_url: String,
    docker_device: String,
    cluster_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_pair: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

fn default_user(os: &str) -> &'static str {
    match os {
        "centos" => "centos",
        "redhat" => "ec2-user",
        "debian" => "admin",
        _ => "ubuntu",
    }
}

/// Terraform provisioner bound to one working directory
pub struct TerraformProvisioner {
    dir: PathBuf,
    config: TerraformConfig,
    nodes: RwLock<Vec<Node>>,
    installer_addr: RwLock<Option<String>>,
}

impl TerraformProvisioner {
    pub fn new(dir: PathBuf, config: TerraformConfig) -> Self {
        Self {
            dir,
            config,
            nodes: RwLock::new(Vec::new()),
            installer_addr: RwLock::new(None),
        }
    }

    /// Rebind to infrastructure created by an earlier process
    pub fn from_state(config: TerraformConfig, state: ProvisionerState) -> Self {
        Self {
            dir: state.dir,
            config,
            nodes: RwLock::new(state.nodes),
            installer_addr: RwLock::new(state.installer_addr),
        }
    }

    fn command(&self, subcommand: &str) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.config.binary)
            .arg(subcommand)
            .arg("-input=false")
            .current_dir(&self.dir)
            .env("TF_IN_AUTOMATION", "1")
            .grace(self.config.grace);
        for (key, value) in self.config.credentials() {
            cmd = cmd.env(key, value);
        }
        cmd
    }

    async fn prepare(&self) -> Result<()> {
        copy_script(&self.config.script_path, &self.dir).await?;
        let vars = serde_json::to_vec_pretty(&self.config.variables())?;
        tokio::fs::write(self.dir.join(TFVARS_FILE), vars).await?;
        Ok(())
    }

    async fn outputs(&self, ctx: &RunContext) -> Result<Vec<Node>> {
        let out = run_tool(
            ctx,
            ToolCommand::new(&self.config.binary)
                .args(["output", "-json"])
                .current_dir(&self.dir)
                .grace(self.config.grace),
        )
        .await?;

        let nodes = parse_outputs(&out.stdout_text())?
            .into_iter()
            .map(|n| n.with_ssh(self.config.ssh_user(), self.config.ssh_key_path()))
            .collect::<Vec<_>>();

        if nodes.len() != self.config.nodes {
            warn!(
                expected = self.config.nodes,
                actual = nodes.len(),
                "terraform returned unexpected node count"
            );
        }
        Ok(nodes)
    }
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    fn kind(&self) -> ProvisionerKind {
        ProvisionerKind::Terraform
    }

    async fn create(&self, ctx: &RunContext) -> Result<Vec<Node>> {
        info!(dir = %self.dir.display(), nodes = self.config.nodes, tag = %self.config.tag, "terraform apply");
        self.prepare().await?;

        run_tool(ctx, self.command("init")).await?;
        run_tool(ctx, self.command("apply").arg("-auto-approve")).await?;

        let nodes = self.outputs(ctx).await?;
        debug!(?nodes, "terraform nodes");

        *self.installer_addr.write() = nodes.first().map(|n| n.public_addr.clone());
        *self.nodes.write() = nodes.clone();
        Ok(nodes)
    }

    async fn destroy(&self, ctx: &RunContext) -> Result<()> {
        if !self.dir.exists() {
            info!(dir = %self.dir.display(), "no terraform state, nothing to destroy");
            return Ok(());
        }

        info!(dir = %self.dir.display(), tag = %self.config.tag, "terraform destroy");
        run_tool(ctx, self.command("destroy").arg("-auto-approve")).await?;
        self.nodes.write().clear();
        Ok(())
    }

    fn node_pool(&self) -> Vec<Node> {
        self.nodes.read().clone()
    }

    fn state(&self) -> ProvisionerState {
        ProvisionerState {
            dir: self.dir.clone(),
            nodes: self.node_pool(),
            installer_addr: self.installer_addr.read().clone(),
        }
    }
}

/// Extract nodes from `terraform output -json`
pub fn parse_outputs(json: &str) -> Result<Vec<Node>> {
    let outputs: serde_json::Value = serde_json::from_str(json)?;

    let list = |name: &str| -> Vec<String> {
        outputs
            .get(name)
            .and_then(|o| o.get("value"))
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    let public = list("public_ips");
    let private = list("private_ips");
    if public.is_empty() {
        return Err(Error::InvalidState(
            "terraform output has no public_ips".to_string(),
        ));
    }

    Ok(public
        .into_iter()
        .enumerate()
        .map(|(i, addr)| Node::new(addr, private.get(i).cloned().unwrap_or_default()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use testbed_common::config::OnpremConfig;

    fn config() -> TestbedConfig {
        TestbedConfig {
            provisioner: Some(ProvisionerKind::Terraform),
            cloud_provider: Some("aws".to_string()),
            onprem: OnpremConfig {
                nodes: 2,
                installer_url: "s3://bucket/installer.tar".to_string(),
                os: "centos".to_string(),
                docker_device: "/dev/xvdb".to_string(),
                ..Default::default()
            },
            aws: Some(AwsConfig {
                region: "us-west-2".to_string(),
                access_key: "AKIA".to_string(),
                secret_key: "secret".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_outputs() {
        let json = r#"{
            "public_ips": {"sensitive": false, "type": ["list", "string"], "value": ["54.1.1.1", "54.1.1.2"]},
            "private_ips": {"sensitive": false, "type": ["list", "string"], "value": ["10.0.0.1", "10.0.0.2"]}
        }"#;
        let nodes = parse_outputs(json).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].public_addr, "54.1.1.2");
        assert_eq!(nodes[1].private_addr, "10.0.0.2");
    }

    #[test]
    fn test_parse_outputs_without_nodes() {
        assert!(matches!(parse_outputs("{}"), Err(Error::InvalidState(_))));
        assert!(parse_outputs("not json").is_err());
    }

    #[test]
    fn test_config_requires_cloud_section() {
        let mut cfg = config();
        cfg.aws = None;
        assert!(TerraformConfig::from_testbed(&cfg, "tag").is_err());

        let tf = TerraformConfig::from_testbed(&config(), "tag").unwrap();
        assert_eq!(tf.ssh_user(), "centos");
    }

    #[tokio::test]
    async fn test_prepare_writes_vars_without_secrets() {
        let script = TempDir::new().unwrap();
        std::fs::write(script.path().join("main.tf"), "# module").unwrap();
        let work = TempDir::new().unwrap();

        let mut cfg = config();
        cfg.onprem.script_path = script.path().to_path_buf();
        let tf = TerraformConfig::from_testbed(&cfg, "e2e-1234").unwrap();
        let provisioner = TerraformProvisioner::new(work.path().join("tf"), tf);
        provisioner.prepare().await.unwrap();

        let vars = std::fs::read_to_string(work.path().join("tf").join(TFVARS_FILE)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&vars).unwrap();
        assert_eq!(parsed["cluster_tag"], "e2e-1234");
        assert_eq!(parsed["nodes"], 2);
        assert_eq!(parsed["region"], "us-west-2");
        assert!(!vars.contains("secret"));
        assert!(work.path().join("tf").join("main.tf").exists());
    }

    #[tokio::test]
    async fn test_destroy_without_state_is_noop() {
        let work = TempDir::new().unwrap();
        let tf = TerraformConfig::from_testbed(&config(), "tag").unwrap();
        let provisioner = TerraformProvisioner::new(work.path().join("never-created"), tf);
        provisioner.destroy(&RunContext::background()).await.unwrap();
    }

    #[test]
    fn test_from_state_restores_nodes() {
        let tf = TerraformConfig::from_testbed(&config(), "tag").unwrap();
        let state = ProvisionerState {
            dir: PathBuf::from("/tmp/tf"),
            nodes: vec![Node::new("1.1.1.1", "10.0.0.1")],
            installer_addr: Some("1.1.1.1".to_string()),
        };
        let provisioner = TerraformProvisioner::from_state(tf, state.clone());
        assert_eq!(provisioner.state(), state);
    }
}
