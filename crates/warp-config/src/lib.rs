//! Agreement site configuration
//!
//! An [`AgreementConfig`] is read from TOML, patched from `WARP_AGREEMENT_*`
//! environment variables and checked with [`Validate`] before a site
//! starts. Durations are written as integer milliseconds.

pub mod config;
pub mod validate;

pub use config::*;
pub use validate::*;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Document is not valid TOML for this schema
    #[error("malformed config: {0}")]
    Toml(String),

    /// Mesh membership is inconsistent with the site identity
    #[error("bad mesh: {0}")]
    Mesh(String),

    /// A single setting is out of range
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    /// An environment override could not be applied
    #[error("cannot apply {var}: {message}")]
    EnvOverride { var: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
