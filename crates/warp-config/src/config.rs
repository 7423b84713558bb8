//! Agreement site configuration

use crate::{ConfigError, Result, Validate};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use warp_telemetry::{LogConfig, LogLevel};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "WARP_AGREEMENT_";

/// Voting policy used by the mesh arbiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Evict the fewest sites that make every witness set match the quorum
    #[default]
    MatchingCardinality,
    /// Trust any report and evict every reported site
    NoQuarter,
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "matching_cardinality" => Ok(Self::MatchingCardinality),
            "no_quarter" => Ok(Self::NoQuarter),
            other => Err(ConfigError::InvalidValue {
                field: "arbiter.strategy".into(),
                message: format!("unknown strategy '{}'", other),
            }),
        }
    }
}

/// Top-level configuration for one agreement site
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgreementConfig {
    /// Site identity and runtime cadence
    pub site: SiteConfig,
    /// Fault arbitration tuning
    pub arbiter: ArbiterConfig,
    /// Logging output
    pub logging: LogConfig,
}

/// Per-site runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// This site's identifier
    pub site_id: u64,

    /// Sites cooperating at startup, including this one
    pub mesh: Vec<u64>,

    /// Interval between heartbeat rounds
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Poll timeout of the inbound mailbox
    #[serde(rename = "receive_timeout_ms", with = "duration_ms")]
    pub receive_timeout: Duration,

    /// Hold transactions until every site has confirmed receipt
    pub use_safety_gate: bool,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site_id: 0,
            mesh: vec![0],
            heartbeat_interval: Duration::from_millis(5),
            receive_timeout: Duration::from_millis(5),
            use_safety_gate: true,
        }
    }
}

/// Mesh arbiter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Voting policy, fixed for the lifetime of the cluster
    pub strategy: StrategyKind,

    /// Poll timeout while waiting for peer views
    #[serde(rename = "receive_timeout_ms", with = "duration_ms")]
    pub receive_timeout: Duration,

    /// How long a wait may stall before progress is logged
    #[serde(rename = "stall_log_interval_ms", with = "duration_ms")]
    pub stall_log_interval: Duration,

    /// Receives spent waiting for relayed views before giving up on them
    pub forward_budget: u32,

    /// Locally made decisions remembered for loop detection
    pub decision_history: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::MatchingCardinality,
            receive_timeout: Duration::from_millis(5),
            stall_log_interval: Duration::from_secs(10),
            forward_budget: 1000,
            decision_history: 100,
        }
    }
}

impl ArbiterConfig {
    /// Number of idle polls after which a stalled wait is logged
    pub fn stall_log_ticks(&self) -> u64 {
        let tick = self.receive_timeout.as_millis().max(1);
        (self.stall_log_interval.as_millis() / tick).max(1) as u64
    }
}

impl AgreementConfig {
    /// Config for a site in the given mesh with default tuning
    pub fn for_site(site_id: u64, mesh: impl IntoIterator<Item = u64>) -> Self {
        Self {
            site: SiteConfig {
                site_id,
                mesh: mesh.into_iter().collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Config tuned for in-process simulations: heartbeat on every step,
    /// millisecond polls, short relay budget
    pub fn testing(site_id: u64, mesh: impl IntoIterator<Item = u64>) -> Self {
        let mut config = Self::for_site(site_id, mesh);
        config.site.heartbeat_interval = Duration::ZERO;
        config.site.receive_timeout = Duration::from_millis(1);
        config.arbiter.receive_timeout = Duration::from_millis(1);
        config.arbiter.stall_log_interval = Duration::from_secs(1);
        config.arbiter.forward_budget = 200;
        config
    }

    /// Parse a TOML document and validate it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Toml(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, apply environment overrides, then validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self =
            toml::from_str(&text).map_err(|e| ConfigError::Toml(e.to_string()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    /// Apply `WARP_AGREEMENT_*` variables from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply overrides from key/value pairs; keys without the prefix are ignored
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            match name {
                "SITE_ID" => self.site.site_id = parse_env(name, value)?,
                "MESH" => {
                    self.site.mesh = value
                        .split(',')
                        .filter(|s| !s.trim().is_empty())
                        .map(|s| parse_env(name, s.trim()))
                        .collect::<Result<_>>()?;
                }
                "STRATEGY" => self.arbiter.strategy = value.parse()?,
                "HEARTBEAT_INTERVAL_MS" => {
                    self.site.heartbeat_interval = Duration::from_millis(parse_env(name, value)?)
                }
                "RECEIVE_TIMEOUT_MS" => {
                    let timeout = Duration::from_millis(parse_env(name, value)?);
                    self.site.receive_timeout = timeout;
                    self.arbiter.receive_timeout = timeout;
                }
                "FORWARD_BUDGET" => self.arbiter.forward_budget = parse_env(name, value)?,
                "LOG_LEVEL" => {
                    self.logging.level = value
                        .parse::<LogLevel>()
                        .map_err(|e| env_error(name, e))?
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn env_error(name: &str, message: impl ToString) -> ConfigError {
    ConfigError::EnvOverride {
        var: format!("{}{}", ENV_PREFIX, name),
        message: message.to_string(),
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| env_error(name, format!("cannot parse '{}'", value)))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
