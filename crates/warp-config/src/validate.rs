//! Configuration validation

use crate::{AgreementConfig, ArbiterConfig, ConfigError, Result, SiteConfig};
use std::collections::BTreeSet;

/// Checks a configuration section for internal consistency
pub trait Validate {
    /// Validate this section
    fn validate(&self) -> Result<()>;
}

impl Validate for AgreementConfig {
    fn validate(&self) -> Result<()> {
        self.site.validate()?;
        self.arbiter.validate()
    }
}

impl Validate for SiteConfig {
    fn validate(&self) -> Result<()> {
        if self.mesh.is_empty() {
            return Err(ConfigError::Mesh("site.mesh must not be empty".into()));
        }
        if !self.mesh.contains(&self.site_id) {
            return Err(ConfigError::Mesh(format!(
                "site.mesh {:?} does not contain site_id {}",
                self.mesh, self.site_id
            )));
        }
        let distinct: BTreeSet<_> = self.mesh.iter().collect();
        if distinct.len() != self.mesh.len() {
            return Err(ConfigError::InvalidValue {
                field: "site.mesh".into(),
                message: "duplicate site ids".into(),
            });
        }
        if self.receive_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "site.receive_timeout_ms".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

impl Validate for ArbiterConfig {
    fn validate(&self) -> Result<()> {
        if self.receive_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "arbiter.receive_timeout_ms".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.stall_log_interval < self.receive_timeout {
            return Err(ConfigError::InvalidValue {
                field: "arbiter.stall_log_interval_ms".into(),
                message: "must not be shorter than the receive timeout".into(),
            });
        }
        if self.decision_history == 0 {
            return Err(ConfigError::InvalidValue {
                field: "arbiter.decision_history".into(),
                message: "must remember at least one decision".into(),
            });
        }
        Ok(())
    }
}
