use thiserror::Error;

use crate::config::ConfigError;
use crate::membership::MembershipError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Node is not running")]
    NotRunning,

    #[error("Node stopped before bootstrap completed")]
    BootstrapAborted,

    #[error("Found errors during shutdown: {}", .0.join("; "))]
    Shutdown(Vec<String>),
}
