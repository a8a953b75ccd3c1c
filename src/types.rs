/// Core error types shared across the ttyjail subsystems
use crate::admission::AdmissionRejected;
use std::path::PathBuf;
use thiserror::Error;

/// One mebibyte, the unit the resource table is expressed in
pub const MB: u64 = 1024 * 1024;

/// Failures reported by a resource-control backend
#[derive(Error, Debug)]
pub enum CgroupError {
    #[error("cgroup I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cgroup not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid cgroup path: {0}")]
    InvalidPath(PathBuf),

    #[error("cgroups unavailable: {0}")]
    Unavailable(String),
}

impl CgroupError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CgroupError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Custom error types for ttyjail
#[derive(Error, Debug)]
pub enum JailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The top-level scope for a command could not be established.
    /// Callers must refuse to serve that command.
    #[error("Unable to create container for {name}: {source}")]
    ContainerCreation {
        name: String,
        #[source]
        source: CgroupError,
    },

    #[error("Sub-scope error: {0}")]
    SubScope(String),

    #[error("Namespace join error: {0}")]
    NamespaceJoin(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cgroup error: {0}")]
    Cgroup(#[from] CgroupError),

    #[error("Admission rejected: {0}")]
    AdmissionRejected(#[from] AdmissionRejected),
}

impl JailError {
    /// Rejections are expected control flow, not infrastructure failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, JailError::AdmissionRejected(_))
    }
}

/// Result type alias for ttyjail operations
pub type Result<T> = std::result::Result<T, JailError>;
