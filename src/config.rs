//! Engine configuration

use crate::error::{QuestError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a `QuestClient`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Highest record id probed by the fallback ownership scan (inclusive)
    #[serde(default = "default_max_scan_id")]
    pub max_scan_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// How long an attempt may stay pending before it fails with a timeout
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_ms: u64,
}

// Defaults
fn default_max_scan_id() -> u64 { 256 }
fn default_confirmation_timeout() -> u64 { 120_000 }

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            max_scan_id: default_max_scan_id(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_ms: default_confirmation_timeout(),
        }
    }
}

impl TrackerConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }
}

impl QuestConfig {
    /// Configuration for a local devnet (fast blocks, few records)
    pub fn for_devnet() -> Self {
        Self {
            identity: IdentityConfig { max_scan_id: 32 },
            tracker: TrackerConfig {
                confirmation_timeout_ms: 15_000,
            },
        }
    }

    /// Parse a TOML document; missing sections fall back to defaults
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: QuestConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.max_scan_id == 0 {
            return Err(QuestError::Config("identity.max_scan_id must be at least 1".into()));
        }
        if self.tracker.confirmation_timeout_ms == 0 {
            return Err(QuestError::Config(
                "tracker.confirmation_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = QuestConfig::from_toml_str("").unwrap();
        assert_eq!(config, QuestConfig::default());
        assert_eq!(config.identity.max_scan_id, 256);
    }

    #[test]
    fn test_partial_toml() {
        let config = QuestConfig::from_toml_str(
            r#"
            [tracker]
            confirmation_timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.tracker.confirmation_timeout(), Duration::from_secs(5));
        assert_eq!(config.identity.max_scan_id, 256);
    }

    #[test]
    fn test_zero_scan_rejected() {
        let err = QuestConfig::from_toml_str("[identity]\nmax_scan_id = 0").unwrap_err();
        assert!(matches!(err, QuestError::Config(_)));
    }
}
