//! Test run configuration
//!
//! The settings struct is read once at startup (TOML or YAML, picked by file
//! extension), validated, and then handed to the provisioning code by value.
//! [`ProvisionerPolicy`] is the part every teardown consults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::ProvisionerKind;

const MASK: &str = "****";

/// Top-level configuration of a test run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    /// Backend used to provision nodes (none when the cluster already exists)
    pub provisioner: Option<ProvisionerKind>,

    /// Cloud to deploy into with terraform: aws | azure
    pub cloud_provider: Option<String>,

    /// Directory for test-specific state (terraform/vagrant working dirs)
    pub state_dir: PathBuf,

    /// Name used for the cluster and as the resource tag prefix
    pub cluster_name: String,

    /// Unique suffix of the resource tag; generated when empty
    pub run_id: Option<String>,

    /// Where collected logs and test results go
    pub report_dir: PathBuf,

    /// Upper bound for a whole test case, including provisioning
    pub test_timeout_secs: u64,

    /// Bare-metal style node configuration
    pub onprem: OnpremConfig,

    /// AWS settings (terraform + aws)
    pub aws: Option<AwsConfig>,

    /// Azure settings (terraform + azure)
    pub azure: Option<AzureConfig>,

    /// Teardown policy
    pub policy: ProvisionerPolicy,

    /// Retry and timeout settings for provisioning
    pub retry: RetrySettings,

    /// Remote command run on every node when collecting logs
    pub log_command: String,
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            provisioner: None,
            cloud_provider: None,
            state_dir: crate::default_state_dir(),
            cluster_name: "testbed".to_string(),
            run_id: None,
            report_dir: PathBuf::from("reports"),
            test_timeout_secs: 3600,
            onprem: OnpremConfig::default(),
            aws: None,
            azure: None,
            policy: ProvisionerPolicy::default(),
            retry: RetrySettings::default(),
            log_command: "sudo journalctl --no-pager -n 5000; sudo tail -n 1000 /var/log/installer*.log"
                .to_string(),
        }
    }
}

/// Node configuration for on-premise style provisioning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OnpremConfig {
    /// Total number of nodes to provision
    pub nodes: usize,

    /// Installer tarball location (URL or local path, depending on backend)
    pub installer_url: String,

    /// Path to the provisioner script directory (terraform module or Vagrantfile)
    pub script_path: PathBuf,

    /// Server profile used for expand operations
    pub expand_profile: Option<String>,

    /// OS flavor: ubuntu | redhat | centos | debian
    pub os: String,

    /// Block device for docker data
    pub docker_device: String,
}

impl OnpremConfig {
    pub fn is_empty(&self) -> bool {
        self.nodes == 0 && self.script_path.as_os_str().is_empty()
    }
}

/// AWS settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    pub key_pair: String,
    pub ssh_key_path: Option<PathBuf>,
    pub ssh_user: Option<String>,
    pub instance_type: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Azure settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub subscription_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub resource_group: String,
    pub location: String,
    pub vm_type: String,
    pub ssh_user: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
}

/// Teardown policy shared by every test in the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerPolicy {
    /// Remove cloud resources after a test completed OK
    pub destroy_on_success: bool,

    /// Remove cloud resources after a failure, timeout or interrupt
    pub destroy_on_failure: bool,

    /// Fetch logs also from nodes where tests completed OK
    pub always_collect_logs: bool,

    /// Record of allocated and not yet cleaned up resource tags
    pub resource_list_file: Option<PathBuf>,
}

impl Default for ProvisionerPolicy {
    fn default() -> Self {
        Self {
            destroy_on_success: true,
            destroy_on_failure: true,
            always_collect_logs: false,
            resource_list_file: None,
        }
    }
}

/// Retry and timeout settings for provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Deadline of each creation attempt, consumed in order
    pub attempt_timeouts_secs: Vec<u64>,

    /// Budget for cleanup that runs after the test context is gone
    pub finalize_timeout_secs: u64,

    /// How long an interrupted tool gets to exit before it is killed
    pub tool_grace_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempt_timeouts_secs: vec![15 * 60, 10 * 60],
            finalize_timeout_secs: 5 * 60,
            tool_grace_secs: 30,
        }
    }
}

impl RetrySettings {
    pub fn attempt_timeouts(&self) -> Vec<Duration> {
        self.attempt_timeouts_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_secs(self.finalize_timeout_secs)
    }

    pub fn tool_grace(&self) -> Duration {
        Duration::from_secs(self.tool_grace_secs)
    }
}

impl TestbedConfig {
    /// Load configuration from file
    ///
    /// A missing file yields the defaults, as the whole configuration may
    /// come from command line flags and environment instead.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        Ok(config)
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let mut invalid = |msg: String| errors.push(Some(Error::InvalidConfig(msg)));

        if self.cluster_name.is_empty() {
            invalid("cluster_name is required".to_string());
        }

        if self.retry.attempt_timeouts_secs.is_empty() {
            invalid("retry.attempt_timeouts_secs must name at least one attempt".to_string());
        }
        if self.retry.attempt_timeouts_secs.iter().any(|s| *s == 0) {
            invalid("retry.attempt_timeouts_secs must be positive".to_string());
        }

        if let Some(kind) = self.provisioner {
            if self.onprem.is_empty() {
                invalid(format!("onprem configuration is required for provisioner {}", kind));
            }
            if self.onprem.nodes == 0 {
                invalid("onprem.nodes must be positive".to_string());
            }
            if !self.onprem.os.is_empty()
                && !matches!(self.onprem.os.as_str(), "ubuntu" | "redhat" | "centos" | "debian")
            {
                invalid(format!("unsupported OS flavor {:?}", self.onprem.os));
            }

            if kind == ProvisionerKind::Terraform {
                match self.cloud_provider.as_deref() {
                    Some("aws") | Some("azure") => {}
                    Some(other) => invalid(format!("unsupported cloud_provider {:?}", other)),
                    None => invalid("cloud_provider is required for terraform".to_string()),
                }
                if self.onprem.os.is_empty() {
                    invalid("onprem.os is required for terraform".to_string());
                }
            }
        }

        match Error::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resource tag of this run's allocation
    pub fn tag(&self) -> String {
        match &self.run_id {
            Some(id) if !id.is_empty() => format!("{}-{}", self.cluster_name, id),
            _ => format!("{}-{}", self.cluster_name, short_run_id()),
        }
    }

    /// Fix the run id so that every later [`tag`](Self::tag) call agrees
    pub fn with_run_id(mut self) -> Self {
        if self.run_id.as_deref().map_or(true, str::is_empty) {
            self.run_id = Some(short_run_id());
        }
        self
    }

    /// Copy of the configuration safe to log
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(aws) = copy.aws.as_mut() {
            if !aws.access_key.is_empty() {
                aws.access_key = MASK.to_string();
            }
            if !aws.secret_key.is_empty() {
                aws.secret_key = MASK.to_string();
            }
        }
        if let Some(azure) = copy.azure.as_mut() {
            if !azure.client_secret.is_empty() {
                azure.client_secret = MASK.to_string();
            }
        }
        copy
    }

    /// Default location of the persisted test state
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

fn short_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn terraform_config() -> TestbedConfig {
        TestbedConfig {
            provisioner: Some(ProvisionerKind::Terraform),
            cloud_provider: Some("aws".to_string()),
            onprem: OnpremConfig {
                nodes: 3,
                installer_url: "s3://bucket/installer.tar".to_string(),
                script_path: PathBuf::from("assets/terraform/aws"),
                os: "ubuntu".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_load_toml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("testbed.toml");
        std::fs::write(
            &path,
            r#"
provisioner = "vagrant"
cluster_name = "e2e"

[onprem]
nodes = 2
script_path = "assets/vagrant"

[policy]
destroy_on_success = false
resource_list_file = "resources.txt"

[retry]
attempt_timeouts_secs = [60, 30, 10]
"#,
        )
        .unwrap();

        let config = TestbedConfig::load(&path).unwrap();
        assert_eq!(config.provisioner, Some(ProvisionerKind::Vagrant));
        assert_eq!(config.onprem.nodes, 2);
        assert!(!config.policy.destroy_on_success);
        assert!(config.policy.destroy_on_failure);
        assert_eq!(config.policy.resource_list_file, Some(PathBuf::from("resources.txt")));
        assert_eq!(config.retry.attempt_timeouts().len(), 3);
        assert_eq!(config.retry.finalize_timeout_secs, 300);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("testbed.yaml");
        std::fs::write(
            &path,
            "provisioner: terraform\ncloud_provider: azure\nonprem:\n  nodes: 1\n  os: centos\n",
        )
        .unwrap();

        let config = TestbedConfig::load(&path).unwrap();
        assert_eq!(config.cloud_provider.as_deref(), Some("azure"));
        assert_eq!(config.onprem.os, "centos");
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = TestbedConfig::load(Path::new("/nonexistent/testbed.toml")).unwrap();
        assert_eq!(config.retry, RetrySettings::default());
        assert!(config.provisioner.is_none());
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let mut config = terraform_config();
        config.cloud_provider = None;
        config.onprem.os = "windows".to_string();
        config.retry.attempt_timeouts_secs.clear();

        let err = config.validate().unwrap_err();
        assert_eq!(err.errors().len(), 3, "{}", err);
    }

    #[test]
    fn test_terraform_config_is_valid() {
        terraform_config().validate().unwrap();
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut config = terraform_config();
        config.aws = Some(AwsConfig {
            access_key: "AKIA".to_string(),
            secret_key: "secret".to_string(),
            ..Default::default()
        });

        let redacted = config.redacted();
        let aws = redacted.aws.unwrap();
        assert_eq!(aws.access_key, MASK);
        assert_eq!(aws.secret_key, MASK);
        assert_eq!(config.aws.unwrap().secret_key, "secret");
    }

    #[test]
    fn test_tag_is_stable_once_run_id_fixed() {
        let config = TestbedConfig::default().with_run_id();
        assert_eq!(config.tag(), config.tag());
        assert!(config.tag().starts_with("testbed-"));
    }
}
