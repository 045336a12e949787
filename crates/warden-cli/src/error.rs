use warden_core::{PermissionError, PolicyError};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to read policy '{0}': {1}")]
    ReadPolicy(String, String),

    #[error("invalid policy '{path}': {source}")]
    Policy { path: String, source: PolicyError },

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("--object must be a JSON object: {0}")]
    InvalidObject(String),
}
