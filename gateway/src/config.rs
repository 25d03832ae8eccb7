use crate::services::ingestion::PunchTypeSource;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main configuration for the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub devices: DeviceConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Empty means `~/.punch-gateway/gateway.db`
    pub path: String,
}

/// Terminal timing, echoed back on every heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub poll_interval_secs: u64,
    /// A device not heard from for this long reads as offline
    pub online_threshold_secs: u64,
    pub error_delay_secs: u64,
    pub utc_offset_minutes: i32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            online_threshold_secs: 60,
            error_delay_secs: 30,
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub max_attempts: u32,
    pub stale_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            stale_timeout_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub punch_type_source: PunchTypeSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_format: String,
    pub log_to_file: bool,
    /// Empty means `~/.punch-gateway/logs`
    pub log_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_to_file: false,
            log_dir: String::new(),
        }
    }
}

impl Config {
    /// Get default configuration file path: `~/.punch-gateway/gateway.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid("Cannot determine home directory".into()))?;
        Ok(home.join(".punch-gateway").join("gateway.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "No configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.server
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr: {}", e)))?;

        if self.devices.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.devices.online_threshold_secs < self.devices.poll_interval_secs {
            return Err(ConfigError::Invalid(
                "online_threshold_secs must not be shorter than poll_interval_secs".into(),
            ));
        }
        if self.devices.utc_offset_minutes.abs() > 14 * 60 {
            return Err(ConfigError::Invalid(
                "utc_offset_minutes must be within +/- 840".into(),
            ));
        }

        if self.commands.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.commands.stale_timeout_secs == 0 || self.commands.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "stale_timeout_secs and sweep_interval_secs must be at least 1".into(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        match self.logging.log_format.as_str() {
            "pretty" | "json" => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "log_format must be 'pretty' or 'json'".into(),
                ))
            }
        }

        Ok(())
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(path = %parent.display(), error = %e, "Failed to create config directory");
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // Write to a temp file, then rename over the target
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(path = %temp_path.display(), error = %e, "Failed to write temp config file");
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved successfully");
        Ok(())
    }

    /// Database file path, resolving the empty default
    pub fn database_path(&self) -> std::result::Result<PathBuf, crate::db::DbError> {
        if self.database.path.trim().is_empty() {
            crate::db::Database::default_path()
        } else {
            Ok(PathBuf::from(&self.database.path))
        }
    }

    pub fn online_threshold(&self) -> Duration {
        Duration::from_secs(self.devices.online_threshold_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.commands.stale_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.commands.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.devices.online_threshold_secs, 60);
        assert_eq!(config.commands.max_attempts, 3);
        assert_eq!(config.commands.stale_timeout_secs, 300);
        assert_eq!(config.ingestion.punch_type_source, PunchTypeSource::Device);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.server.listen_addr = "not-an-addr".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.commands.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.devices.online_threshold_secs = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.log_format = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            "[commands]\nmax_attempts = 5\n\n[ingestion]\npunch_type_source = \"time_window\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.commands.max_attempts, 5);
        assert_eq!(config.commands.stale_timeout_secs, 300);
        assert_eq!(config.ingestion.punch_type_source, PunchTypeSource::TimeWindow);
        assert_eq!(config.devices.poll_interval_secs, 30);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("gateway.toml");

        let mut original = Config::default();
        original.devices.utc_offset_minutes = 420;
        original.save(&config_path).expect("save should succeed");

        let loaded = Config::load(&config_path).expect("load should succeed");
        assert_eq!(loaded.devices.utc_offset_minutes, 420);
        assert_eq!(loaded.server.listen_addr, original.server.listen_addr);

        assert!(!config_path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.commands.sweep_interval_secs, 60);
    }

    #[test]
    fn test_default_path() {
        let path = Config::default_path().unwrap();
        assert!(path.to_string_lossy().contains(".punch-gateway"));
        assert!(path.to_string_lossy().ends_with("gateway.toml"));
    }
}
