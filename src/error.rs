//! Error types of the service host.
//!
//! [`ConfigError`] covers reading, parsing and validating configuration,
//! [`ServiceError`] covers assembling the components from it.

use esg_tasks::broker::BrokerError;
use esg_tasks::store::StorageError;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML is malformed or does not match the expected schema.
    #[error("failed to parse config TOML: {source}")]
    Parse {
        /// The underlying TOML error.
        #[from]
        source: toml::de::Error,
    },

    /// The configuration parsed but contains unusable values.
    #[error("config validation error: {message}")]
    Validation {
        /// What is wrong.
        message: String,
    },

    /// The config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// The underlying I/O error.
        source: std::io::Error,
        /// The file that was being read.
        path: String,
    },
}

impl ConfigError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Errors raised while assembling the service from configuration.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The registry storage could not be opened.
    #[error("failed to open task registry: {0}")]
    Storage(#[from] StorageError),

    /// The broker transport could not be opened.
    #[error("failed to open broker: {0}")]
    Broker(#[from] BrokerError),
}
