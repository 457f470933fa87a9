//! Error types for testbed

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using testbed Error
pub type Result<T> = std::result::Result<T, Error>;

/// Why a context stopped accepting work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// Cancelled explicitly (operator interrupt, parent cancelled)
    Cancelled,
    /// Deadline passed
    DeadlineExceeded,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Cancelled => write!(f, "context cancelled"),
            Interruption::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

/// testbed error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("resource tag not unique: {0}")]
    DuplicateTag(String),

    #[error("provisioning attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    #[error("{operation} interrupted due to upper context: {cause}{}", attempt_suffix(.attempt))]
    OuterInterrupted {
        operation: String,
        cause: Interruption,
        attempt: Option<Box<Error>>,
    },

    #[error("destroy failed: {0}")]
    DestroyFailure(#[source] Box<Error>),

    #[error("log collection failed: {0}")]
    LogCollection(String),

    #[error("failed to persist resource ledger {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} interrupted: {cause}")]
    Interrupted {
        operation: String,
        cause: Interruption,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Tool {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{0} not found in PATH")]
    ToolNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("panic in {context}: {message}")]
    Panicked { context: String, message: String },

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Combine optional errors into one.
    ///
    /// `None` entries are dropped, a single remaining error is returned as-is
    /// and nested aggregates are flattened.
    pub fn aggregate<I>(errors: I) -> Option<Error>
    where
        I: IntoIterator<Item = Option<Error>>,
    {
        let mut flat = Vec::new();
        for err in errors.into_iter().flatten() {
            match err {
                Error::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Aggregate(flat)),
        }
    }

    /// Errors contained in this one (itself unless it is an aggregate)
    pub fn errors(&self) -> Vec<&Error> {
        match self {
            Error::Aggregate(inner) => inner.iter().flat_map(|e| e.errors()).collect(),
            other => vec![other],
        }
    }

    /// True if this error or any aggregated error was caused by an interruption
    pub fn is_interruption(&self) -> bool {
        self.errors().iter().any(|e| {
            matches!(
                e,
                Error::Interrupted { .. } | Error::OuterInterrupted { .. }
            )
        })
    }
}

fn attempt_suffix(attempt: &Option<Box<Error>>) -> String {
    match attempt {
        Some(err) => format!(", result={}", err),
        None => String::new(),
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
