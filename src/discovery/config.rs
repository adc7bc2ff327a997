//! Discovery Configuration

use crate::error::{Error, Result};
use crate::topology::identity::FeaturePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How aggressively route tables are pruned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAlgorithm {
    /// Skip addresses that are directly attached or already routed
    #[default]
    UniqueLevelDescent,
    /// Program every descriptor
    Exhaustive,
}

/// Per-session discovery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Deadline for a single request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Retries for inquiry and identify after the first attempt fails.
    /// Zero gives each device a single attempt.
    #[serde(default = "default_max_inquiry_retries")]
    pub max_inquiry_retries: u32,

    /// Extra attempts a quirk hook may request after a timeout
    #[serde(default = "default_max_quirk_retries")]
    pub max_quirk_retries: u32,

    #[serde(default)]
    pub route_algorithm: RouteAlgorithm,

    #[serde(default = "default_max_stack_depth")]
    pub max_stack_depth: usize,

    /// Force write cache on or off on ATA devices
    #[serde(default)]
    pub want_write_cache: Option<bool>,

    /// Force read look-ahead on or off on ATA devices
    #[serde(default)]
    pub want_read_ahead: Option<bool>,

    /// Give up retrying failed sessions after this long
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

fn default_request_timeout_ms() -> u64 {
    2_000
}

fn default_max_inquiry_retries() -> u32 {
    3
}

fn default_max_quirk_retries() -> u32 {
    1
}

fn default_max_stack_depth() -> usize {
    64
}

fn default_max_elapsed_secs() -> u64 {
    60
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_inquiry_retries: default_max_inquiry_retries(),
            max_quirk_retries: default_max_quirk_retries(),
            route_algorithm: RouteAlgorithm::default(),
            max_stack_depth: default_max_stack_depth(),
            want_write_cache: None,
            want_read_ahead: None,
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

impl DiscoveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_elapsed_secs)
    }

    pub fn feature_policy(&self) -> FeaturePolicy {
        FeaturePolicy {
            write_cache: self.want_write_cache,
            read_ahead: self.want_read_ahead,
        }
    }

    /// Reject settings that would stall or never make progress
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(Error::Configuration("request_timeout_ms must be non-zero".into()));
        }
        if self.max_stack_depth < 4 {
            return Err(Error::Configuration(format!(
                "max_stack_depth {} cannot hold a session",
                self.max_stack_depth
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: DiscoveryConfig = serde_yaml::from_str("route_algorithm: exhaustive\n").unwrap();
        assert_eq!(config.route_algorithm, RouteAlgorithm::Exhaustive);
        assert_eq!(config.max_inquiry_retries, 3);
        assert_eq!(config.max_quirk_retries, 1);
        assert_eq!(config.max_stack_depth, 64);
        assert_eq!(config.request_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = DiscoveryConfig {
            request_timeout_ms: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_zero_inquiry_retries_is_valid() {
        let config = DiscoveryConfig {
            max_inquiry_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
