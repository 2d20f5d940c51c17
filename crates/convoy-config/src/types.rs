//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [instance]      # instance type and optional fixed host id
//! [scaling]       # pub/sub broker connection and debounce window
//! [multi_main]    # leader election timing
//! [broker]        # task broker offer validity and deadlines
//! ```

use std::time::Duration;

use convoy_types::InstanceType;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

pub mod defaults {
    pub const REDIS_URL: &str = "redis://127.0.0.1:6379";
    pub const KEY_PREFIX: &str = "convoy";
    /// Trailing-edge debounce window for coalesced commands.
    pub const DEBOUNCE_MS: u64 = 300;
    pub const LEADER_TTL_SECS: u64 = 10;
    pub const LEADER_CHECK_INTERVAL_SECS: u64 = 3;
    /// How long a runner's task offer stays valid.
    pub const OFFER_VALIDITY_MS: u64 = 5_000;
    pub const TASK_TIMEOUT_MS: u64 = 60_000;
}

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged. Use the accessor methods to read a
/// section with defaults applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvoyConfig {
    pub instance: Option<InstanceSection>,
    pub scaling: Option<ScalingSection>,
    pub multi_main: Option<MultiMainSection>,
    pub broker: Option<BrokerSection>,
}

impl ConvoyConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: ConvoyConfig) {
        if other.instance.is_some() {
            self.instance = other.instance;
        }
        if other.scaling.is_some() {
            self.scaling = other.scaling;
        }
        if other.multi_main.is_some() {
            self.multi_main = other.multi_main;
        }
        if other.broker.is_some() {
            self.broker = other.broker;
        }
    }

    pub fn instance(&self) -> InstanceSection {
        self.instance.clone().unwrap_or_default()
    }

    pub fn scaling(&self) -> ScalingSection {
        self.scaling.clone().unwrap_or_default()
    }

    pub fn multi_main(&self) -> MultiMainSection {
        self.multi_main.clone().unwrap_or_default()
    }

    pub fn broker(&self) -> BrokerSection {
        self.broker.clone().unwrap_or_default()
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let scaling = self.scaling();
        if scaling.debounce_ms == 0 {
            return Err(ConfigError::invalid(
                "scaling.debounce_ms",
                "must be greater than zero",
            ));
        }
        if scaling.key_prefix.is_empty() {
            return Err(ConfigError::invalid("scaling.key_prefix", "must not be empty"));
        }

        let multi_main = self.multi_main();
        if multi_main.check_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "multi_main.check_interval_secs",
                "must be greater than zero",
            ));
        }
        if multi_main.enabled && multi_main.leader_ttl_secs <= multi_main.check_interval_secs {
            return Err(ConfigError::invalid(
                "multi_main.leader_ttl_secs",
                "must be longer than multi_main.check_interval_secs",
            ));
        }

        if self.broker().offer_validity_ms == 0 {
            return Err(ConfigError::invalid(
                "broker.offer_validity_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of this process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSection {
    #[serde(rename = "type")]
    pub instance_type: InstanceType,
    /// Fixed host id. Generated at boot when absent.
    pub host_id: Option<String>,
}

/// Scaling (multi-process) mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingSection {
    /// When false, the publisher is a no-op and no subscriber is started.
    pub enabled: bool,
    pub redis_url: String,
    /// Namespace for channels and coordination keys.
    pub key_prefix: String,
    pub debounce_ms: u64,
}

impl Default for ScalingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: defaults::REDIS_URL.to_string(),
            key_prefix: defaults::KEY_PREFIX.to_string(),
            debounce_ms: defaults::DEBOUNCE_MS,
        }
    }
}

impl ScalingSection {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Leader election for multiple main instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiMainSection {
    pub enabled: bool,
    /// Expiry of the leader key; a leader that stops renewing loses the role after this.
    pub leader_ttl_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for MultiMainSection {
    fn default() -> Self {
        Self {
            enabled: false,
            leader_ttl_secs: defaults::LEADER_TTL_SECS,
            check_interval_secs: defaults::LEADER_CHECK_INTERVAL_SECS,
        }
    }
}

impl MultiMainSection {
    pub fn leader_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_ttl_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Task broker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub offer_validity_ms: u64,
    pub default_task_timeout_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            offer_validity_ms: defaults::OFFER_VALIDITY_MS,
            default_task_timeout_ms: defaults::TASK_TIMEOUT_MS,
        }
    }
}

impl BrokerSection {
    pub fn offer_validity(&self) -> Duration {
        Duration::from_millis(self.offer_validity_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults() {
        let config = ConvoyConfig::from_toml("").unwrap();
        assert_eq!(config, ConvoyConfig::default());
        assert_eq!(config.instance().instance_type, InstanceType::Main);
        assert!(!config.scaling().enabled);
        assert_eq!(config.scaling().debounce(), Duration::from_millis(300));
        assert_eq!(config.broker().offer_validity_ms, 5_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[instance]
type = "worker"
host_id = "worker-fixed"

[scaling]
enabled = true
redis_url = "redis://queue:6379"

[multi_main]
enabled = true
leader_ttl_secs = 20
check_interval_secs = 5

[broker]
offer_validity_ms = 2500
"#;
        let config = ConvoyConfig::from_toml(toml).unwrap();
        let instance = config.instance();
        assert_eq!(instance.instance_type, InstanceType::Worker);
        assert_eq!(instance.host_id.as_deref(), Some("worker-fixed"));

        let scaling = config.scaling();
        assert!(scaling.enabled);
        assert_eq!(scaling.redis_url, "redis://queue:6379");
        // Unset fields in a present section keep their defaults
        assert_eq!(scaling.key_prefix, "convoy");
        assert_eq!(scaling.debounce_ms, 300);

        assert_eq!(config.multi_main().leader_ttl(), Duration::from_secs(20));
        assert_eq!(config.broker().default_task_timeout_ms, 60_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_merge_overrides_sections() {
        let mut base = ConvoyConfig::from_toml("[scaling]\nenabled = true\n").unwrap();
        let overlay = ConvoyConfig::from_toml("[broker]\noffer_validity_ms = 100\n").unwrap();
        base.merge(overlay);
        assert!(base.scaling().enabled);
        assert_eq!(base.broker().offer_validity_ms, 100);

        let overlay = ConvoyConfig::from_toml("[scaling]\nenabled = false\n").unwrap();
        base.merge(overlay);
        assert!(!base.scaling().enabled);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let config = ConvoyConfig::from_toml("[scaling]\ndebounce_ms = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let config = ConvoyConfig::from_toml(
            "[multi_main]\nenabled = true\nleader_ttl_secs = 3\ncheck_interval_secs = 3\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("multi_main.leader_ttl_secs"));

        let config = ConvoyConfig::from_toml("[broker]\noffer_validity_ms = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_check_interval() {
        let config = ConvoyConfig::from_toml(
            "[multi_main]\nenabled = true\nleader_ttl_secs = 10\ncheck_interval_secs = 0\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("multi_main.check_interval_secs"));
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = ConvoyConfig::from_toml("[instance]\ntype = \"webhook\"\n").unwrap();
        let text = config.to_toml().unwrap();
        assert!(text.contains("type = \"webhook\""));
        assert_eq!(ConvoyConfig::from_toml(&text).unwrap(), config);
    }
}
