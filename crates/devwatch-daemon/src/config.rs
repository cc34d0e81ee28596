//! Configuration loading and validation

use anyhow::Result;
use devwatch_core::MatchRules;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    /// Rules a device must match to be managed
    #[serde(default = "default_filter")]
    pub filter: MatchRules,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            service: ServiceConfig::default(),
            device: DeviceConfig::default(),
            filter: default_filter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Enumerate present devices at startup
    #[serde(default = "default_true")]
    pub scan_on_start: bool,
    /// Follow hot-plug events after the initial scan
    #[serde(default = "default_true")]
    pub monitor: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            scan_on_start: true,
            monitor: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Exit once the last managed device is removed
    #[serde(default)]
    pub auto_quit: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Open device nodes without write access
    #[serde(default)]
    pub read_only: bool,
}

fn default_true() -> bool {
    true
}

fn default_filter() -> MatchRules {
    let mut rules = MatchRules::new();
    rules.set_subsystem("hidraw");
    rules
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save an example configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let mut config = Config::default();
    config.filter.add_property("ID_BUS", "usb");
    config.filter.add_tag("uaccess");

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("devwatch.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.filter.subsystem.as_deref(), Some("hidraw"));
        assert!(config.daemon.monitor);
        assert!(!config.service.auto_quit);
    }

    #[test]
    fn test_load_partial_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devwatch.toml");
        std::fs::write(
            &path,
            r#"
[service]
auto_quit = true

[filter]
subsystem = "input"
tags = ["seat"]

[filter.properties]
ID_INPUT_KEYBOARD = "1"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert!(config.service.auto_quit);
        assert!(config.daemon.scan_on_start);
        assert_eq!(config.filter.subsystem.as_deref(), Some("input"));
        assert_eq!(config.filter.tags, vec!["seat"]);
        assert_eq!(
            config.filter.properties.get("ID_INPUT_KEYBOARD").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_saved_default_config_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devwatch.toml");
        save_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.filter.subsystem.as_deref(), Some("hidraw"));
        assert_eq!(config.filter.tags, vec!["uaccess"]);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devwatch.toml");
        std::fs::write(&path, "[service]\nauto_quit = \"sometimes\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
