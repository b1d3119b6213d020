//! Engine configuration
//!
//! ```rust
//! use rvoip_call_control::config::{CallControlConfig, RelatedCallPrivilege};
//!
//! let config = CallControlConfig::new()
//!     .with_event_buffer(64)
//!     .with_related_call_privilege(RelatedCallPrivilege::GrantMonitor);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.event_buffer, 64);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::{CallControlError, Result};
use crate::logging::LoggingConfig;

/// Top level configuration for [`CallControl`](crate::CallControl)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallControlConfig {
    /// Capacity of the broadcast channel carrying [`CallEvent`](crate::CallEvent)s
    pub event_buffer: usize,
    /// Capacity of the provider event feed created by `CallControl::event_feed`
    pub provider_event_queue: usize,
    pub gather: GatherDefaults,
    pub conference: ConferenceConfig,
    pub logging: LoggingConfig,
}

impl Default for CallControlConfig {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            provider_event_queue: 1024,
            gather: GatherDefaults::default(),
            conference: ConferenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Defaults applied by `DigitGatherParams::from_defaults`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatherDefaults {
    /// Zero disables the first-digit timer
    pub first_digit_timeout_ms: u64,
    /// Zero disables the inter-digit timer
    pub inter_digit_timeout_ms: u64,
    /// Digits that end a gather; empty for none
    pub terminators: String,
}

impl Default for GatherDefaults {
    fn default() -> Self {
        Self {
            first_digit_timeout_ms: 5_000,
            inter_digit_timeout_ms: 3_000,
            terminators: "#".to_string(),
        }
    }
}

impl GatherDefaults {
    pub fn first_digit_timeout(&self) -> Duration {
        Duration::from_millis(self.first_digit_timeout_ms)
    }

    pub fn inter_digit_timeout(&self) -> Duration {
        Duration::from_millis(self.inter_digit_timeout_ms)
    }
}

/// Privilege handling when enumerating related conference calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelatedCallPrivilege {
    /// Leave privileges untouched; callers grant monitor rights explicitly
    RequireExplicit,
    /// Upgrade calls without privilege to `Monitor` while enumerating
    GrantMonitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConferenceConfig {
    /// Largest party count accepted by `setup_conference`
    pub max_parties: u32,
    pub related_call_privilege: RelatedCallPrivilege,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            max_parties: 32,
            related_call_privilege: RelatedCallPrivilege::RequireExplicit,
        }
    }
}

impl CallControlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn with_provider_event_queue(mut self, capacity: usize) -> Self {
        self.provider_event_queue = capacity;
        self
    }

    pub fn with_gather_defaults(mut self, gather: GatherDefaults) -> Self {
        self.gather = gather;
        self
    }

    pub fn with_max_conference_parties(mut self, max_parties: u32) -> Self {
        self.conference.max_parties = max_parties;
        self
    }

    pub fn with_related_call_privilege(mut self, policy: RelatedCallPrivilege) -> Self {
        self.conference.related_call_privilege = policy;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| CallControlError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| CallControlError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Install the global `tracing` subscriber described by the `logging`
    /// section. Call once at startup, before creating the engine.
    pub fn init_logging(&self) -> Result<()> {
        crate::logging::setup_logging(&self.logging)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_buffer == 0 {
            return Err(CallControlError::config("event_buffer must be greater than zero"));
        }
        if self.provider_event_queue == 0 {
            return Err(CallControlError::config(
                "provider_event_queue must be greater than zero",
            ));
        }
        if self.conference.max_parties < 3 {
            return Err(CallControlError::config(
                "conference.max_parties must allow at least three parties",
            ));
        }
        crate::logging::parse_log_level(&self.logging.level)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = CallControlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.conference.related_call_privilege, RelatedCallPrivilege::RequireExplicit);
    }

    #[test]
    fn test_from_toml_partial_document() {
        let config = CallControlConfig::from_toml_str(
            r#"
            event_buffer = 32

            [gather]
            first_digit_timeout_ms = 750

            [conference]
            related_call_privilege = "grant_monitor"

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(config.event_buffer, 32);
        assert_eq!(config.provider_event_queue, 1024);
        assert_eq!(config.gather.first_digit_timeout(), Duration::from_millis(750));
        assert_eq!(config.gather.inter_digit_timeout_ms, 3_000);
        assert_eq!(config.conference.related_call_privilege, RelatedCallPrivilege::GrantMonitor);
        assert!(config.logging.json);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(CallControlConfig::new().with_event_buffer(0).validate().is_err());
        assert!(CallControlConfig::new().with_max_conference_parties(2).validate().is_err());
        assert!(CallControlConfig::from_toml_str("[logging]\nlevel = \"chatty\"").is_err());
    }

    #[test]
    fn test_init_logging_rejects_unknown_level() {
        let config = CallControlConfig::new().with_logging(LoggingConfig::new("chatty"));
        let err = config.init_logging().unwrap_err();
        assert!(matches!(err, CallControlError::Configuration { .. }), "{err}");
    }
}
