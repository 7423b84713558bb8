//! Telemetry bootstrap for warp agreement sites
//!
//! Agreement sites log through `tracing`; this crate owns the subscriber
//! setup so binaries and tests configure output the same way.

pub mod logging;

pub use logging::{init_logging, init_test_logging, LogConfig, LogFormat, LogLevel, LogOutput};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Log file or its directory could not be opened
    #[error("log output: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown log level '{0}'")]
    UnknownLevel(String),

    /// A configured filter directive does not parse
    #[error("bad filter directive {0}")]
    BadDirective(String),

    /// A global subscriber was already set
    #[error("subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
