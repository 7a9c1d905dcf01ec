//! Error taxonomy for the supervisor core.
//!
//! Mirrors the shape used by process-manager crates in this space: one
//! top-level error per subsystem, `#[from]` conversions for the I/O and
//! parsing errors that naturally bubble up, and plain string payloads for
//! conditions that have no richer underlying error.

use thiserror::Error;

/// Errors raised by [`crate::manager::ProcessManager`] operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The active configuration could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The PID registry could not be read or written.
    #[error("pid registry error: {0}")]
    PidFile(#[from] PidFileError),

    /// No configuration path was supplied and none was previously configured.
    #[error("no configuration path supplied and none previously configured")]
    NoConfigPath,
}

/// Errors raised while loading or validating a tool configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read from disk.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file contents were not valid TOML for this shape.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Underlying parse error.
        #[source]
        source: Box<toml::de::Error>,
    },

    /// The configuration declared zero tools.
    #[error("configuration declares no tools")]
    Empty,

    /// Two tools share a name.
    #[error("duplicate tool name: {0}")]
    DuplicateName(String),

    /// A `depends_on` cycle was detected among the declared tools.
    #[error("dependency cycle detected: {0}")]
    DependencyCycle(String),
}

/// Errors raised by [`crate::pidfile`] operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// The registry file could not be written atomically.
    #[error("failed to write pid file {path}: {source}")]
    Write {
        /// Path that failed to write.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The registry file contents were not valid JSON for this shape.
    #[error("failed to parse pid file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}
