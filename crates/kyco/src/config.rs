//! TOML configuration for the controller binary.

use crate::cli::CliArgs;
use anyhow::Context;
use controller::{ControllerConfig, DEFAULT_PORT};
use kyco_event_system::ChannelConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub napps: NAppSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address switches connect to (e.g. "127.0.0.1:6633")
    pub bind_address: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_max_connections() -> usize {
    1000
}

fn default_read_buffer_size() -> usize {
    4096
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: format!("127.0.0.1:{DEFAULT_PORT}"),
            max_connections: default_max_connections(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NAppSettings {
    pub core_directory: String,
    pub directory: String,
}

impl Default for NAppSettings {
    fn default() -> Self {
        Self {
            core_directory: "napps/core".to_string(),
            directory: "napps/apps".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Per-channel capacity; 0 means unbounded
    #[serde(default)]
    pub channel_capacity: usize,
    #[serde(default = "default_put_timeout_ms")]
    pub put_timeout_ms: u64,
    #[serde(default = "default_stage_join_timeout_ms")]
    pub stage_join_timeout_ms: u64,
}

fn default_put_timeout_ms() -> u64 {
    5000
}

fn default_stage_join_timeout_ms() -> u64 {
    5000
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 0,
            put_timeout_ms: default_put_timeout_ms(),
            stage_join_timeout_ms: default_stage_join_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads the configuration, writing the default one first if `path` does
    /// not exist.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(dir) = &args.core_napps_dir {
            self.napps.core_directory = dir.to_string_lossy().to_string();
        }
        if let Some(dir) = &args.napps_dir {
            self.napps.directory = dir.to_string_lossy().to_string();
        }
        if let Some(bind_address) = &args.bind_address {
            self.server.bind_address = bind_address.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", self.server.bind_address));
        }
        if self.server.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        if self.server.read_buffer_size == 0 {
            return Err("read_buffer_size must be at least 1".to_string());
        }
        if self.napps.core_directory.is_empty() || self.napps.directory.is_empty() {
            return Err("NApp directories cannot be empty".to_string());
        }
        if self.pipeline.stage_join_timeout_ms == 0 {
            return Err("stage_join_timeout_ms must be greater than zero".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            ));
        }

        Ok(())
    }

    pub fn to_controller_config(&self) -> anyhow::Result<ControllerConfig> {
        let bind_address = self
            .server
            .bind_address
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind address {}", self.server.bind_address))?;

        Ok(ControllerConfig {
            bind_address,
            core_napps_dir: self.napps.core_directory.clone().into(),
            napps_dir: self.napps.directory.clone().into(),
            channels: ChannelConfig {
                capacity: (self.pipeline.channel_capacity > 0).then_some(self.pipeline.channel_capacity),
                put_timeout: Duration::from_millis(self.pipeline.put_timeout_ms),
            },
            stage_join_timeout: Duration::from_millis(self.pipeline.stage_join_timeout_ms),
            max_connections: self.server.max_connections,
            read_buffer_size: self.server.read_buffer_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let controller_config = config.to_controller_config().expect("default converts");
        assert_eq!(controller_config.bind_address.port(), 6633);
        assert_eq!(controller_config.channels.capacity, None);
        assert_eq!(controller_config.stage_join_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file_writes_default() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("kyco.toml");

        let config = AppConfig::load_from_file(&path).await.expect("default config");

        assert_eq!(config.server.bind_address, "127.0.0.1:6633");
        let written = std::fs::read_to_string(&path).expect("default file written");
        assert!(written.contains("[napps]"));
    }

    #[tokio::test]
    async fn test_load_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("kyco.toml");
        std::fs::write(
            &path,
            "[server]\nbind_address = \"0.0.0.0:6653\"\n\n[pipeline]\nchannel_capacity = 128\n",
        )
        .expect("write config");

        let config = AppConfig::load_from_file(&path).await.expect("parses");
        let controller_config = config.to_controller_config().expect("converts");

        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(controller_config.channels.capacity, Some(128));
        assert_eq!(controller_config.bind_address.port(), 6653);
    }

    #[tokio::test]
    async fn test_load_malformed_file_fails() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("kyco.toml");
        std::fs::write(&path, "[server\n").expect("write config");

        assert!(AppConfig::load_from_file(&path).await.is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = AppConfig::default();
        config.server.bind_address = "not an address".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.napps.directory.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.stage_join_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = AppConfig::default();
        config.apply_cli(&CliArgs {
            config_path: PathBuf::from("kyco.toml"),
            core_napps_dir: Some(PathBuf::from("/srv/core")),
            napps_dir: None,
            bind_address: Some("127.0.0.1:7000".to_string()),
            log_level: Some("trace".to_string()),
            json_logs: true,
        });

        assert_eq!(config.napps.core_directory, "/srv/core");
        assert_eq!(config.napps.directory, "napps/apps");
        assert_eq!(config.server.bind_address, "127.0.0.1:7000");
        assert_eq!(config.logging.level, "trace");
        assert!(config.logging.json_format);
    }
}
