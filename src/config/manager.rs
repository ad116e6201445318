//! Configuration Manager

use super::{Config, ReadMode, SocketMode};
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(mode) = std::env::var("CONNMUX_READ_MODE") {
            config.manager.read_mode = parse_read_mode(&mode)
                .with_context(|| format!("Invalid CONNMUX_READ_MODE: {}", mode))?;
        }

        if let Ok(mode) = std::env::var("CONNMUX_SOCKET_MODE") {
            config.manager.socket_mode = parse_socket_mode(&mode)
                .with_context(|| format!("Invalid CONNMUX_SOCKET_MODE: {}", mode))?;
        }

        if let Ok(timeout) = std::env::var("CONNMUX_CONNECT_TIMEOUT") {
            config.manager.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid CONNMUX_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(timeout) = std::env::var("CONNMUX_REQUEST_TIMEOUT") {
            config.manager.request_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid CONNMUX_REQUEST_TIMEOUT: {}", timeout))?;
        }

        if let Ok(interval) = std::env::var("CONNMUX_GC_INTERVAL") {
            config.gc.interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid CONNMUX_GC_INTERVAL: {}", interval))?;
        }

        if let Ok(ttl) = std::env::var("CONNMUX_DATA_SERVER_TTL") {
            config.ttl.data_server = humantime::parse_duration(&ttl)
                .with_context(|| format!("Invalid CONNMUX_DATA_SERVER_TTL: {}", ttl))?;
        }

        if let Ok(ttl) = std::env::var("CONNMUX_REDIRECTOR_TTL") {
            config.ttl.redirector = humantime::parse_duration(&ttl)
                .with_context(|| format!("Invalid CONNMUX_REDIRECTOR_TTL: {}", ttl))?;
        }

        if let Ok(log_level) = std::env::var("CONNMUX_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

pub fn parse_read_mode(value: &str) -> Result<ReadMode> {
    match value.to_ascii_lowercase().as_str() {
        "sync" => Ok(ReadMode::Sync),
        "async" => Ok(ReadMode::Async),
        other => bail!("read mode must be 'sync' or 'async', got '{}'", other),
    }
}

pub fn parse_socket_mode(value: &str) -> Result<SocketMode> {
    match value.to_ascii_lowercase().as_str() {
        "blocking" => Ok(SocketMode::Blocking),
        "nonblocking" => Ok(SocketMode::NonBlocking),
        other => bail!("socket mode must be 'blocking' or 'nonblocking', got '{}'", other),
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_manager_config()
            .with_context(|| "Manager configuration validation failed")?;

        self.validate_gc_config()
            .with_context(|| "Garbage collector configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_manager_config(&self) -> Result<()> {
        if self.manager.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.manager.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        if self.manager.max_message_size == 0 {
            bail!("max_message_size must be greater than 0");
        }

        if self.manager.max_message_size > i32::MAX as usize {
            bail!("max_message_size cannot exceed {} bytes", i32::MAX);
        }

        if self.manager.max_logical_connections == 0 {
            bail!("max_logical_connections must be greater than 0");
        }

        // Each logical connection needs its own non-zero stream id on its physical
        if self.manager.max_logical_connections > u16::MAX as usize {
            bail!("max_logical_connections cannot exceed {}", u16::MAX);
        }

        Ok(())
    }

    fn validate_gc_config(&self) -> Result<()> {
        if self.gc.interval.is_zero() {
            bail!("gc.interval must be greater than 0");
        }

        if self.gc.interval > Duration::from_secs(60) {
            bail!("gc.interval cannot exceed 60s");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        read_mode: Option<ReadMode>,
        connect_timeout: Option<u64>,
        request_timeout: Option<u64>,
        data_server_ttl: Option<u64>,
        no_gc: bool,
    ) {
        if let Some(mode) = read_mode {
            self.manager.read_mode = mode;
            tracing::info!("CLI override: read mode set to {:?}", mode);
        }

        if let Some(secs) = connect_timeout {
            self.manager.connect_timeout = Duration::from_secs(secs);
            tracing::info!("CLI override: connect timeout set to {}s", secs);
        }

        if let Some(secs) = request_timeout {
            self.manager.request_timeout = Duration::from_secs(secs);
            tracing::info!("CLI override: request timeout set to {}s", secs);
        }

        if let Some(secs) = data_server_ttl {
            self.ttl.data_server = Duration::from_secs(secs);
            tracing::info!("CLI override: data server TTL set to {}s", secs);
        }

        if no_gc {
            self.gc.enabled = false;
            tracing::info!("CLI override: background garbage collector disabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("connmux.toml");
        fs::write(
            &path,
            r#"
[manager]
read_mode = "sync"
socket_mode = "nonblocking"
connect_timeout = "3s"
request_timeout = "500ms"
max_message_size = 1048576
max_logical_connections = 128
tcp_nodelay = false

[ttl]
redirector = "20m"
data_server = "5m"

[gc]
enabled = false
interval = "5ms"

[logging]
level = "debug"
"#,
        )?;

        let config = ConfigManager::load_from_file(&path)?;
        assert_eq!(config.manager.read_mode, ReadMode::Sync);
        assert_eq!(config.manager.socket_mode, SocketMode::NonBlocking);
        assert_eq!(config.manager.request_timeout, Duration::from_millis(500));
        assert_eq!(config.ttl.redirector, Duration::from_secs(1200));
        assert!(!config.gc.enabled);
        assert_eq!(config.logging.level, "debug");
        Ok(())
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = ConfigManager::load_from_file(&temp_dir.path().join("absent.toml"))?;
        assert_eq!(config.manager.read_mode, ReadMode::Async);
        Ok(())
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut config = Config::default();
        config.gc.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.manager.max_logical_connections = 70_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(parse_read_mode("SYNC").unwrap(), ReadMode::Sync);
        assert_eq!(parse_socket_mode("nonblocking").unwrap(), SocketMode::NonBlocking);
        assert!(parse_read_mode("sometimes").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = Config::default();
        config.merge_with_cli_args(Some(ReadMode::Sync), Some(2), None, Some(7), true);

        assert_eq!(config.manager.read_mode, ReadMode::Sync);
        assert_eq!(config.manager.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.ttl.data_server, Duration::from_secs(7));
        assert!(!config.gc.enabled);
    }
}
