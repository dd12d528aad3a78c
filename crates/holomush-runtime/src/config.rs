//! Runtime configuration for the plugin subsystem.
//!
//! Loaded from `holomush.yaml`, with `${VAR}` / `${VAR:-default}`
//! environment expansion:
//!
//! ```yaml
//! plugins:
//!   dir: ./plugins
//!   call-timeout-ms: 5000
//! log:
//!   level: info
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found at the specified path.
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Failed to read the configuration file.
    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),

    /// YAML parsing failed.
    #[error("configuration parse error: {0}")]
    Parse(String),

    /// A value failed validation.
    #[error("invalid configuration: {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings for the plugin subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HoloConfig {
    /// Plugin host settings.
    pub plugins: PluginsConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// Plugin host settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PluginsConfig {
    /// Root directory holding one subdirectory per plugin bundle.
    pub dir: PathBuf,
    /// Bound on one binary-plugin delivery RPC, in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("plugins"),
            call_timeout_ms: 5_000,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogConfig {
    /// Default level directive, e.g. `info` or `holomush_plugin=debug`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn validate_config(config: &HoloConfig) -> ConfigResult<()> {
    if config.plugins.dir.as_os_str().is_empty() {
        return Err(ConfigError::Invalid {
            field: "plugins.dir",
            reason: "must not be empty".into(),
        });
    }
    if config.plugins.call_timeout_ms == 0 {
        return Err(ConfigError::Invalid {
            field: "plugins.call-timeout-ms",
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

/// Configuration loader with multi-path search.
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Creates a loader with no search paths.
    pub fn new() -> Self {
        Self {
            search_paths: Vec::new(),
        }
    }

    /// Adds a search path for configuration files.
    pub fn add_search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Adds the current directory to the search paths.
    pub fn with_current_dir(self) -> Self {
        if let Ok(cwd) = std::env::current_dir() {
            self.add_search_path(cwd)
        } else {
            self
        }
    }

    /// Loads configuration from the first available source, falling back to
    /// defaults when no file is found.
    pub fn load(&self) -> ConfigResult<HoloConfig> {
        if let Some(path) = self.find_config_file() {
            return self.load_from_file(&path);
        }
        info!("no configuration file found, using defaults");
        Ok(HoloConfig::default())
    }

    /// Loads configuration from a specific file.
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<HoloConfig> {
        let path = path.as_ref();
        info!("loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        self.load_from_str(&content)
    }

    /// Loads configuration from a YAML string.
    pub fn load_from_str(&self, yaml: &str) -> ConfigResult<HoloConfig> {
        let expanded = expand_env_vars(yaml);
        let config: HoloConfig =
            serde_yaml::from_str(&expanded).map_err(|e| ConfigError::Parse(e.to_string()))?;
        validate_config(&config)?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        const CONFIG_NAMES: &[&str] = &["holomush.yaml", "holomush.yml", ".holomush.yaml"];

        for search_path in &self.search_paths {
            for name in CONFIG_NAMES {
                let path = search_path.join(name);
                debug!("checking for config file: {}", path.display());
                if path.exists() {
                    return Some(path);
                }
            }
        }
        None
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new().with_current_dir()
    }
}

/// Expands environment variables in the format `${VAR}` or `${VAR:-default}`.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(:-([^}]*))?\}")
        .unwrap_or_else(|e| unreachable!("expansion regex is fixed: {e}"));

    for cap in re.captures_iter(content) {
        let full_match = cap.get(0).map(|m| m.as_str()).unwrap_or_default();
        let var_name = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        let default_value = cap.get(3).map(|m| m.as_str());

        let value = std::env::var(var_name)
            .ok()
            .or_else(|| default_value.map(String::from))
            .unwrap_or_default();

        result = result.replace(full_match, &value);
    }
    result
}

/// Loads configuration with default search paths.
pub fn load_config() -> ConfigResult<HoloConfig> {
    ConfigLoader::default().load()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = ConfigLoader::new().load_from_str("").unwrap();
        assert_eq!(config, HoloConfig::default());
        assert_eq!(config.plugins.call_timeout_ms, 5_000);
    }

    #[test]
    fn parses_a_full_config() {
        let yaml = r#"
plugins:
  dir: /srv/mush/plugins
  call-timeout-ms: 250
log:
  level: debug
"#;
        let config = ConfigLoader::new().load_from_str(yaml).unwrap();
        assert_eq!(config.plugins.dir, PathBuf::from("/srv/mush/plugins"));
        assert_eq!(config.plugins.call_timeout_ms, 250);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let yaml = "plugins:\n  call-timeout-ms: 0\n";
        assert!(matches!(
            ConfigLoader::new().load_from_str(yaml),
            Err(ConfigError::Invalid {
                field: "plugins.call-timeout-ms",
                ..
            })
        ));
    }

    #[test]
    fn env_var_default_value_applies() {
        let yaml = "plugins:\n  dir: ${HOLOMUSH_DOES_NOT_EXIST:-/fallback/plugins}\n";
        let config = ConfigLoader::new().load_from_str(yaml).unwrap();
        assert_eq!(config.plugins.dir, PathBuf::from("/fallback/plugins"));
    }

    #[test]
    fn loads_from_file_in_search_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("holomush.yaml"), "log:\n  level: warn\n").unwrap();

        let config = ConfigLoader::new()
            .add_search_path(dir.path())
            .load()
            .unwrap();
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn missing_file_reports_not_found() {
        assert!(matches!(
            ConfigLoader::new().load_from_file("/no/such/holomush.yaml"),
            Err(ConfigError::FileNotFound(_))
        ));
    }
}
