//! Audit configuration
//!
//! Loaded optionally from a JSON file; every field has a default so a partial
//! file (or none at all) is valid. CLI flags override file values.

use crate::errors::{AuditError, AuditResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Limits applied to a single recursive membership check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipLimits {
    /// Maximum group nesting depth followed
    pub max_depth: usize,
    /// Maximum number of group expansions per check
    pub max_expansions: usize,
}

impl Default for MembershipLimits {
    fn default() -> Self {
        Self {
            max_depth: 32,
            max_expansions: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Number of GPOs analyzed concurrently
    pub max_concurrency: usize,
    /// Wall-clock bound on one GPO's analysis
    pub gpo_timeout_secs: u64,
    /// Per-call directory operation timeout
    pub operation_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Extra attempts after a transient container lookup failure
    pub transient_retries: u32,
    /// Apply preceding same-trustee deny entries when extracting writers
    pub honor_deny_aces: bool,
    /// Treat `gPLink` entries flagged disabled as links
    pub include_disabled_links: bool,
    pub membership: MembershipLimits,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            gpo_timeout_secs: 120,
            operation_timeout_secs: 30,
            connect_timeout_secs: 15,
            transient_retries: 1,
            honor_deny_aces: true,
            include_disabled_links: false,
            membership: MembershipLimits::default(),
        }
    }
}

impl AuditConfig {
    /// Load a configuration file and validate it
    pub fn from_file(path: &Path) -> AuditResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: AuditConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AuditResult<()> {
        if self.max_concurrency == 0 {
            return Err(AuditError::Configuration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.gpo_timeout_secs == 0 || self.operation_timeout_secs == 0 {
            return Err(AuditError::Configuration(
                "timeouts must be non-zero".to_string(),
            ));
        }
        if self.membership.max_depth == 0 || self.membership.max_expansions == 0 {
            return Err(AuditError::Configuration(
                "membership limits must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn gpo_timeout(&self) -> Duration {
        Duration::from_secs(self.gpo_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
