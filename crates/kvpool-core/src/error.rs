//! Error types for configuration and settings resolution.

use std::path::PathBuf;

use thiserror::Error;

use crate::resource::ResourceType;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration or resolving backend settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A driver or section name outside the registered [`ResourceType`] set.
    #[error("no such KVS type: {0}")]
    UnknownType(String),

    #[error("{ty} is not configured for environment '{environment}'")]
    NotConfigured {
        ty: ResourceType,
        environment: String,
    },

    #[error("{ty} database name is empty for environment '{environment}'")]
    MissingDatabaseName {
        ty: ResourceType,
        environment: String,
    },
}
