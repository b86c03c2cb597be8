use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = KongError> = std::result::Result<T, E>;

/// Error kinds surfaced by the core. Each operation fails with exactly one
/// of these; backend failures are never folded into a success result.
#[derive(Debug, Error)]
pub enum KongError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("'{name}' already exists in {parent}")]
    DuplicateName { parent: String, name: String },

    #[error("folder {0} is not empty (use recursive to delete)")]
    NotEmpty(String),

    #[error("cannot move {node} into its own descendant {dest}")]
    CyclicMove { node: String, dest: String },

    #[error("job {id} was already submitted as {external_id}")]
    AlreadySubmitted { id: u64, external_id: String },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("backend rejected submission: {0}")]
    SubmissionError(String),

    #[error("transient failure: {0}")]
    TransientError(String),

    #[error("timed out waiting for lock at {}", .0.display())]
    LockTimeout(PathBuf),

    #[error("cannot resolve target '{0}'")]
    UnresolvedTarget(String),

    #[error("output not available: {0}")]
    NotAvailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
