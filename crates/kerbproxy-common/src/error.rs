//! Error types for configuration loading and validation.

use thiserror::Error;

/// Errors that can occur while loading or validating a [`ProxyAuthConfig`].
///
/// [`ProxyAuthConfig`]: crate::ProxyAuthConfig
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML or has the wrong shape.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A value was parsed but is not acceptable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// A secret was expected in the environment but is absent.
    #[error("Environment variable {0} is not set")]
    MissingEnv(String),
}

/// Result type alias using `ConfigError`.
pub type Result<T> = std::result::Result<T, ConfigError>;
