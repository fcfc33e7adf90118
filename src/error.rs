//! Error types shared by the CNI plugin and the route daemon.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for brcni operations.
pub type Result<T> = std::result::Result<T, CniError>;

/// Main error type for brcni.
#[derive(Error, Debug)]
pub enum CniError {
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("{name} is missing from the environment")]
    Env { name: String },

    #[error("failed to lock {path:?}: {reason}")]
    Lock { path: PathBuf, reason: String },

    #[error("no free address left in subnet {subnet}")]
    Exhausted { subnet: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{op} failed: {reason}")]
    KernelOp { op: String, reason: String },

    #[error("cluster api error: {reason}")]
    ClusterApi { reason: String },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CniError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn kernel(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::KernelOp { op: op.into(), reason: reason.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// CNI error code reported to the container runtime.
    ///
    /// Codes below 100 are the well-known CNI codes,
    /// 100 and up are plugin specific.
    pub fn code(&self) -> u32 {
        match self {
            Self::NotFound { .. } => 3,
            Self::Env { .. } => 4,
            Self::Io { .. } => 5,
            Self::Json { .. } => 6,
            Self::Config { .. } => 7,
            Self::Lock { .. } => 11,
            Self::Exhausted { .. } => 100,
            Self::KernelOp { .. } => 101,
            Self::ClusterApi { .. } => 102,
        }
    }
}

impl From<kube::Error> for CniError {
    fn from(err: kube::Error) -> Self {
        Self::ClusterApi { reason: err.to_string() }
    }
}
