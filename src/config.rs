//! TOML configuration for the bridge binary.
//!
//! Lives at `<config dir>/controlbridge/bridge.toml` unless a path is given.
//! Every field has a default, so a partial file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::bridge::{
    AdbSettings, BridgeSettings, DeadzoneSettings, FlagTrigger, SupervisorSettings,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub adb: AdbConfig,
    pub supervisor: SupervisorConfig,
    pub input: InputConfig,
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AdbConfig {
    pub executable: String,
    pub log_args: Vec<String>,
    pub clear_args: Vec<String>,
    pub stop_server_on_exit: bool,
}

impl Default for AdbConfig {
    fn default() -> Self {
        let adb = AdbSettings::default();
        Self {
            executable: adb.executable,
            log_args: adb.log_args,
            clear_args: adb.clear_args,
            stop_server_on_exit: adb.stop_server_on_exit,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub settle_delay_ms: u64,
    pub reader_join_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            probe_timeout_ms: 1500,
            connect_timeout_ms: 3000,
            max_reconnect_attempts: 2,
            settle_delay_ms: 500,
            reader_join_timeout_ms: 100,
            shutdown_timeout_ms: 3000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct InputConfig {
    pub deadzone_magnitude: f32,
    pub deadzone_angle_deg: f32,
    pub off_axis_scale: f32,
    pub flag_trigger: FlagTrigger,
}

impl Default for InputConfig {
    fn default() -> Self {
        let deadzone = DeadzoneSettings::default();
        Self {
            deadzone_magnitude: deadzone.magnitude,
            deadzone_angle_deg: deadzone.angle_deg,
            off_axis_scale: deadzone.off_axis_scale,
            flag_trigger: FlagTrigger::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<tracing::Level, ConfigError> {
        self.level
            .parse::<tracing::Level>()
            .map_err(|e| ConfigError::Invalid {
                field: "logging.level",
                reason: e.to_string(),
            })
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl BridgeConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("controlbridge").join("bridge.toml"))
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml(&content)
    }

    /// Load the file, writing the defaults there first if it does not exist.
    pub async fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        if !exists {
            info!("No config at {}, writing defaults", path.display());
            let config = BridgeConfig::default();
            config.save(path).await?;
            return Ok(config);
        }

        Self::load(path).await
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await.map_err(io_err)?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adb.executable.trim().is_empty() {
            return Err(invalid("adb.executable", "must not be empty"));
        }
        if self.adb.log_args.is_empty() {
            return Err(invalid("adb.log_args", "must not be empty"));
        }

        let s = &self.supervisor;
        for (field, value) in [
            ("supervisor.poll_interval_ms", s.poll_interval_ms),
            ("supervisor.probe_timeout_ms", s.probe_timeout_ms),
            ("supervisor.connect_timeout_ms", s.connect_timeout_ms),
            ("supervisor.shutdown_timeout_ms", s.shutdown_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if s.max_reconnect_attempts == 0 {
            return Err(invalid("supervisor.max_reconnect_attempts", "must be at least 1"));
        }

        let input = &self.input;
        if !(0.0..1.0).contains(&input.deadzone_magnitude) {
            return Err(invalid(
                "input.deadzone_magnitude",
                format!("{} is outside [0, 1)", input.deadzone_magnitude),
            ));
        }
        if !(0.0..=45.0).contains(&input.deadzone_angle_deg) {
            return Err(invalid(
                "input.deadzone_angle_deg",
                format!("{} is outside [0, 45]", input.deadzone_angle_deg),
            ));
        }
        if !(0.0..=1.0).contains(&input.off_axis_scale) {
            return Err(invalid(
                "input.off_axis_scale",
                format!("{} is outside [0, 1]", input.off_axis_scale),
            ));
        }

        self.logging.level()?;
        Ok(())
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        let s = &self.supervisor;
        BridgeSettings {
            adb: AdbSettings {
                executable: self.adb.executable.clone(),
                log_args: self.adb.log_args.clone(),
                clear_args: self.adb.clear_args.clone(),
                stop_server_on_exit: self.adb.stop_server_on_exit,
            },
            supervisor: SupervisorSettings {
                poll_interval: Duration::from_millis(s.poll_interval_ms),
                probe_timeout: Duration::from_millis(s.probe_timeout_ms),
                connect_timeout: Duration::from_millis(s.connect_timeout_ms),
                max_reconnect_attempts: s.max_reconnect_attempts,
                settle_delay: Duration::from_millis(s.settle_delay_ms),
                reader_join_timeout: Duration::from_millis(s.reader_join_timeout_ms),
                shutdown_timeout: Duration::from_millis(s.shutdown_timeout_ms),
                stop_server_on_exit: self.adb.stop_server_on_exit,
            },
            deadzone: DeadzoneSettings {
                magnitude: self.input.deadzone_magnitude,
                angle_deg: self.input.deadzone_angle_deg,
                off_axis_scale: self.input.off_axis_scale,
            },
            flag_trigger: self.input.flag_trigger,
        }
    }
}
