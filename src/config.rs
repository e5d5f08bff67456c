use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::controller::PollerSettings;
use crate::dispatch::MqttSettings;
use crate::interpreter::{ButtonBindings, ServiceNames};

pub const CONFIG_ENV_VAR: &str = "JOYPAD_CONTROL_CONFIG";
const CONFIG_DIR: &str = "joypad-control";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub device: DeviceConfig,
    pub bindings: ButtonBindings,
    pub services: ServiceNames,
    pub dispatch: DispatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            device: DeviceConfig::default(),
            bindings: ButtonBindings::default(),
            services: ServiceNames::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub index: usize,
    pub poll_interval_ms: u64,
    pub settle_duration_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: 0,
            poll_interval_ms: 1,
            settle_duration_ms: 10,
        }
    }
}

impl DeviceConfig {
    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            device_index: self.index,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            settle_duration: Duration::from_millis(self.settle_duration_ms),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    #[default]
    Mqtt,
    Log,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub kind: DispatchKind,
    pub mqtt: MqttSettings,
}

impl Config {
    /// `$JOYPAD_CONTROL_CONFIG`, else `<config dir>/joypad-control/config.toml`.
    pub fn default_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, self.to_toml()?).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path`, writing the defaults there first if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("Creating default configuration at {}", path.display());
            let config = Config::default();
            config.save(path)?;
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "device.poll_interval_ms must be at least 1".to_string(),
            ));
        }

        let threshold = self.bindings.axis_threshold;
        if !(threshold > 0.0 && threshold < 0.5) {
            return Err(ConfigError::Invalid(format!(
                "bindings.axis_threshold must be inside (0, 0.5), got {}",
                threshold
            )));
        }

        let mut seen: HashMap<usize, &str> = HashMap::new();
        for (name, index) in self.bindings.indices() {
            if let Some(other) = seen.insert(index, name) {
                return Err(ConfigError::Invalid(format!(
                    "bindings.{} and bindings.{} both use button {}",
                    other, name, index
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config = Config::from_toml(
            r#"
            log_level = "debug"

            [device]
            settle_duration_ms = 25

            [dispatch]
            kind = "log"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.device.settle_duration_ms, 25);
        assert_eq!(config.device.poll_interval_ms, 1);
        assert_eq!(config.dispatch.kind, DispatchKind::Log);
        assert_eq!(config.bindings, ButtonBindings::default());
        assert_eq!(config.dispatch.mqtt.topic_prefix, "microdrop");

        let settings = config.device.poller_settings();
        assert_eq!(settings.settle_duration, Duration::from_millis(25));
    }

    #[test]
    fn rejects_invalid_values() {
        let zero_interval = "[device]\npoll_interval_ms = 0\n";
        assert!(matches!(
            Config::from_toml(zero_interval),
            Err(ConfigError::Invalid(_))
        ));

        let threshold = "[bindings]\naxis_threshold = 0.5\n";
        assert!(matches!(
            Config::from_toml(threshold),
            Err(ConfigError::Invalid(_))
        ));

        let duplicate = "[bindings]\nrun = 0\n";
        let err = Config::from_toml(duplicate).unwrap_err();
        assert!(err.to_string().contains("button 0"));

        assert!(matches!(
            Config::from_toml("[dispatch]\nkind = \"carrier-pigeon\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn writes_defaults_when_missing() {
        let dir = std::env::temp_dir().join(format!("joypad-control-test-{}", std::process::id()));
        let path = dir.join("nested").join(CONFIG_FILE);
        let _ = fs::remove_dir_all(&dir);

        let created = Config::load_or_init(&path).unwrap();
        assert_eq!(created, Config::default());
        assert!(path.exists());

        let reloaded = Config::load_or_init(&path).unwrap();
        assert_eq!(reloaded, created);

        let _ = fs::remove_dir_all(&dir);
    }
}
