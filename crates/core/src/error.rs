//! Error types shared by the gridflow crates.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for configuration and session setup.
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value is out of range or inconsistent
    #[error("Config error: {0}")]
    Config(String),

    /// The configuration file could not be parsed
    #[error("Failed to parse config '{path}': {source}")]
    Parse {
        /// Path of the file that failed to parse.
        path: PathBuf,
        /// Underlying RON error.
        #[source]
        source: ron::error::SpannedError,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;
