//! Persisted test state
//!
//! Records what a provisioning run created so that a later process can
//! destroy it or collect its logs without provisioning again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use testbed_common::{Error, ProvisionerKind, Result};

use crate::provisioner::{Provisioner, ProvisionerState};

/// State of a provisioned cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestState {
    pub provisioner: ProvisionerKind,
    pub state_dir: PathBuf,
    /// Resource tag recorded in the ledger for this cluster
    pub tag: String,
    pub created_at: DateTime<Utc>,
    pub provisioner_state: ProvisionerState,
}

impl TestState {
    pub fn new(provisioner: &dyn Provisioner, state_dir: &Path, tag: &str) -> Self {
        Self {
            provisioner: provisioner.kind(),
            state_dir: state_dir.to_path_buf(),
            tag: tag.to_string(),
            created_at: Utc::now(),
            provisioner_state: provisioner.state(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(Error::InvalidState("state_dir is empty".to_string()));
        }
        if self.provisioner_state.dir.as_os_str().is_empty() {
            return Err(Error::InvalidState("provisioner state dir is empty".to_string()));
        }
        if self.provisioner_state.nodes.is_empty() {
            return Err(Error::InvalidState("provisioner state has no nodes".to_string()));
        }
        if self.tag.is_empty() {
            return Err(Error::InvalidState("resource tag is empty".to_string()));
        }
        Ok(())
    }

    /// Load and validate a state file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;
        state.validate()?;
        Ok(state)
    }

    /// Load a state file if it exists
    pub fn load_optional(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    /// Atomically replace the state file
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&serde_json::to_vec_pretty(self)?)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| Error::Io(e.error))?;

        debug!(path = %path.display(), tag = %self.tag, "state saved");
        Ok(())
    }

    /// Remove the state file once the infrastructure is gone
    pub fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
