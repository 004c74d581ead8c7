use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use huddle_sfu::engine::loopback::LoopbackConfig;
use huddle_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::logging::parse_log_level;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
    pub engine: LoopbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Origins allowed by CORS; empty allows any
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }

        // HUDDLE_SERVER__HTTP_PORT, HUDDLE_SFU__MAX_ROOMS, ...
        builder = builder.add_source(
            Environment::with_prefix("HUDDLE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the whole configuration, reporting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }

        if let Err(e) = parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if self.sfu.outbound_queue_capacity == 0 {
            errors.push("sfu.outbound_queue_capacity must be at least 1".to_string());
        }

        if self.engine.rtc_min_port > self.engine.rtc_max_port {
            errors.push(format!(
                "engine.rtc_min_port ({}) is greater than engine.rtc_max_port ({})",
                self.engine.rtc_min_port, self.engine.rtc_max_port
            ));
        }
        if self.engine.media_codecs.is_empty() {
            errors.push("engine.media_codecs must list at least one codec".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:8080");
        assert_eq!(config.sfu.max_peers_per_room, 50);
        assert_eq!(config.engine.media_codecs.len(), 3);
    }

    #[test]
    fn test_zero_sweep_interval_is_valid() {
        let mut config = Config::default();
        config.sfu.sweep_interval_secs = 0;
        assert!(config.validate().is_ok());
        assert_eq!(config.sfu.sweep_interval(), None);
    }

    #[test]
    fn test_validate_reports_every_error() {
        let mut config = Config::default();
        config.server.http_port = 0;
        config.logging.level = "loud".to_string();
        config.logging.format = "xml".to_string();
        config.sfu.outbound_queue_capacity = 0;
        config.engine.rtc_min_port = 50000;
        config.engine.rtc_max_port = 40000;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().any(|e| e.starts_with("server.http_port")));
        assert!(errors.iter().any(|e| e.starts_with("engine.rtc_min_port")));
    }

    #[test]
    fn test_load_partial_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  http_port: 9000\nsfu:\n  max_rooms: 12\nengine:\n  announced_ip: \"203.0.113.7\"\n  rtc_min_port: 20000\n  rtc_max_port: 20100"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.http_port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.sfu.max_rooms, 12);
        assert_eq!(config.sfu.max_peers_per_room, 50);
        assert_eq!(config.engine.announced_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(config.engine.rtc_min_port, 20000);
        assert_eq!(config.engine.media_codecs.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::from_file(&dir.path().join("absent.yaml")).is_err());
    }
}
