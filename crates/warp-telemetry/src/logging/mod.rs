//! Subscriber setup for agreement sites
//!
//! Every site logs through `tracing` with a `site` field on each event, so a
//! single process hosting several sites stays readable. The filter is the
//! configured level plus optional per-module directives; `RUST_LOG`
//! replaces both when set.

use crate::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, Once};
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Verbosity floor for every module without its own directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Name as written in filter directives
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(TelemetryError::UnknownLevel(s.to_string())),
        };
        Ok(level)
    }
}

/// Event rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event, for log shippers
    Json,
    Pretty,
    /// Single line per event
    Compact,
}

/// Where events are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Appended to a file; parent directories are created
    File(PathBuf),
}

/// Logging section of a site's configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,

    /// Extra filter directives such as `warp_agreement::arbiter=debug`
    pub directives: Vec<String>,

    /// Print the emitting module
    pub include_target: bool,

    /// Print source file and line
    pub include_source_location: bool,

    /// Print thread ids; sites sharing a process run on their own threads
    pub include_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            directives: Vec::new(),
            include_target: true,
            include_source_location: false,
            include_thread_ids: true,
        }
    }
}

impl LogConfig {
    /// Filter built from `RUST_LOG` if set, otherwise from the level and directives
    pub fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let mut filter = EnvFilter::new(self.level.as_str());
        for raw in &self.directives {
            let directive: Directive = raw
                .parse()
                .map_err(|e| TelemetryError::BadDirective(format!("{}: {}", raw, e)))?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

/// Install the global subscriber described by `config`
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = config.env_filter()?;
    match &config.output {
        LogOutput::Stdout => install(config, std::io::stdout, filter),
        LogOutput::Stderr => install(config, std::io::stderr, filter),
        LogOutput::File(path) => install(config, Mutex::new(open_append(path)?), filter),
    }
}

/// Install a trace-level compact subscriber once per process.
///
/// Safe to call from every test; later calls and an already-installed
/// global subscriber are ignored.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let config = LogConfig {
            level: LogLevel::Trace,
            include_target: false,
            ..Default::default()
        };
        let _ = init_logging(&config);
    });
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn install<W>(config: &LogConfig, writer: W, filter: EnvFilter) -> Result<()>
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(filter)
        .with_target(config.include_target)
        .with_file(config.include_source_location)
        .with_line_number(config.include_source_location)
        .with_thread_ids(config.include_thread_ids);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}

#[cfg(test)]
mod tests;
