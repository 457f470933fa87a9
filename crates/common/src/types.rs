//! Core types for testbed

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;

/// A provisioned machine
///
/// A node only carries connection metadata. The remote resource behind it is
/// owned by the allocation's resource tag, so the same node may be listed
/// again from provisioner state without implying a new allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Address reachable from the test runner
    pub public_addr: String,
    /// Address inside the cluster network
    #[serde(default)]
    pub private_addr: String,
    /// SSH login user
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// SSH private key used to reach the node
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

impl Node {
    pub fn new(public_addr: impl Into<String>, private_addr: impl Into<String>) -> Self {
        Self {
            public_addr: public_addr.into(),
            private_addr: private_addr.into(),
            ssh_user: default_ssh_user(),
            ssh_key_path: None,
            ssh_port: default_ssh_port(),
        }
    }

    pub fn with_ssh(mut self, user: impl Into<String>, key_path: Option<PathBuf>) -> Self {
        self.ssh_user = user.into();
        self.ssh_key_path = key_path;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.private_addr.is_empty() {
            write!(f, "{}", self.public_addr)
        } else {
            write!(f, "{}/{}", self.public_addr, self.private_addr)
        }
    }
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

/// Provisioning backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerKind {
    Terraform,
    Vagrant,
}

impl ProvisionerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionerKind::Terraform => "terraform",
            ProvisionerKind::Vagrant => "vagrant",
        }
    }
}

impl fmt::Display for ProvisionerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisionerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "terraform" => Ok(ProvisionerKind::Terraform),
            "vagrant" => Ok(ProvisionerKind::Vagrant),
            other => Err(Error::InvalidConfig(format!("unknown provisioner {:?}", other))),
        }
    }
}

/// Outcome of a finished test as seen by teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Ok,
    Failed,
}

impl TestStatus {
    pub fn from_failed(failed: bool) -> Self {
        if failed {
            TestStatus::Failed
        } else {
            TestStatus::Ok
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Ok => write!(f, "ok"),
            TestStatus::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_defaults_when_deserialized() {
        let node: Node = serde_json::from_str(r#"{"public_addr": "10.0.0.1"}"#).unwrap();
        assert_eq!(node.ssh_user, "ubuntu");
        assert_eq!(node.ssh_port, 22);
        assert_eq!(node.to_string(), "10.0.0.1");
    }

    #[test]
    fn provisioner_kind_parses() {
        assert_eq!("vagrant".parse::<ProvisionerKind>().unwrap(), ProvisionerKind::Vagrant);
        assert!("ansible".parse::<ProvisionerKind>().is_err());
    }
}
