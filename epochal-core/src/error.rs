//! Error types for the epochal-core crate.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level error type for runner, hook and checkpoint operations.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot average metric '{key}': window has zero total weight")]
    EmptyWindow { key: String },

    #[error("Training step failed: {0}")]
    Step(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RunnerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation(msg.into())
    }

    pub fn step(msg: impl Into<String>) -> Self {
        Self::Step(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Wrap an I/O failure together with the path it happened on.
    pub fn fs(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;
