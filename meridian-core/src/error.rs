//! Error taxonomy shared by the routing and balancing primitives.

use thiserror::Error;

/// Errors raised by configuration loading, route registration and backend selection.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for the expected schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A duration-valued setting could not be parsed.
    #[error("invalid `{field}` duration {value:?}: {source}")]
    InvalidDuration {
        /// Name of the offending setting.
        field: &'static str,
        /// Raw value as written in the configuration.
        value: String,
        /// Underlying parse failure.
        #[source]
        source: humantime::DurationError,
    },

    /// Any other semantic configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// A route with the same key has already been registered.
    #[error("route `{0}` already exists")]
    RouteExists(String),

    /// No route is registered under the requested key.
    #[error("no such route: `{0}`")]
    NoSuchRoute(String),

    /// Every backend of the pool is currently marked unhealthy.
    #[error("no healthy backend available")]
    NoHealthyBackend,
}

/// Convenience alias used throughout `meridian-core`.
pub type Result<T> = std::result::Result<T, Error>;
