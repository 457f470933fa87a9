//! testbed common library
//!
//! Shared types, errors and configuration for the testbed crates.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{ProvisionerPolicy, RetrySettings, TestbedConfig};
pub use error::{Error, Interruption, Result};
pub use types::*;

/// testbed version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_state_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".testbed")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
