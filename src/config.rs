//! Gateway runtime configuration.
//!
//! Covers the ambient knobs of the host side: scan window, an optional
//! fixed peer address, and the default command target. Power-manager
//! tunables are compile-time constants in [`crate::power::manager`] and
//! deliberately not configurable here.

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::core::error::Result;
use crate::protocol::command::Target;

/// Host-side gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// BLE scan window in seconds.
    pub scan_timeout_secs: f64,

    /// Connect to this address directly, bypassing name/UUID filtering.
    pub address: Option<String>,

    /// Default target for commands: "0".."9" or "ALL".
    pub default_node: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 10.0,
            address: None,
            default_node: "0".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Scan window as a duration.
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.scan_timeout_secs.max(0.0))
    }

    /// Parse the default target.
    pub fn default_target(&self) -> Result<Target> {
        Target::parse(&self.default_node)
    }

    /// Load from a TOML file.
    #[cfg(feature = "cli")]
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| crate::core::error::GatewayError::config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.scan_timeout(), Duration::from_secs(10));
        assert_eq!(config.default_target().unwrap(), Target::Node(0));
        assert!(config.address.is_none());
    }

    #[test]
    fn test_invalid_default_node_rejected() {
        let config = GatewayConfig {
            default_node: "12".to_string(),
            ..Default::default()
        };
        assert!(config.default_target().is_err());
    }

    #[cfg(feature = "cli")]
    #[test]
    fn test_parse_toml() {
        let config: GatewayConfig = toml::from_str(
            r#"
            scan_timeout_secs = 5.0
            address = "AA:BB:CC:DD:EE:FF"
            default_node = "ALL"
            "#,
        )
        .unwrap();
        assert_eq!(config.scan_timeout(), Duration::from_secs(5));
        assert_eq!(config.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(config.default_target().unwrap(), Target::All);
    }
}
