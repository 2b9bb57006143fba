//! Configuration Module
//!
//! Layered configuration for the bridge and the listing tool:
//! - Built-in defaults
//! - Optional TOML file with `${VAR}` / `${VAR:-default}` substitution
//! - Environment variable overrides (`MQTT_ANNOTATOR__SECTION__KEY`)
//! - Command-line flags, applied by the binaries on top of the result

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use grafana::{GrafanaConfig, GrafanaEndpoint};
pub use mqtt::{BrokerAddress, BrokerProtocol, MqttConfig};

mod grafana;
mod mqtt;


/// Prefix for environment overrides
const ENV_PREFIX: &str = "MQTT_ANNOTATOR";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// A URL that does not parse or uses an unsupported scheme
    InvalidUrl(String),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::InvalidUrl(msg) => write!(f, "Invalid URL: {}", msg),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker connection and subscriptions
    pub mqtt: MqttConfig,
    /// Annotation service
    pub grafana: GrafanaConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file with environment overrides.
    ///
    /// Environment overrides use double underscores for nesting:
    /// - `MQTT_ANNOTATOR__MQTT__URL=tcp://broker:1883` overrides `mqtt.url`
    /// - `MQTT_ANNOTATOR__MQTT__TOPICS=a,b` overrides `mqtt.topics`
    /// - `MQTT_ANNOTATOR__GRAFANA__TAGS=mqtt,events` overrides `grafana.tags`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "warn")?
            .set_default("mqtt.protocol_version", "3.1.1")?
            .set_default("mqtt.qos", 0)?
            .set_default("mqtt.keep_alive", 30)?
            .set_default("mqtt.connect_timeout", "30s")?
            .set_default("mqtt.subscribe_timeout", "10s")?
            .set_default("mqtt.reconnect_interval", "1s")?
            .set_default("mqtt.max_reconnect_interval", "10m")?
            .set_default("mqtt.disconnect_grace", "250ms")?
            .set_default("mqtt.session_expiry", "1h")?
            .set_default("mqtt.event_buffer", 1024)?
            .set_default("mqtt.max_packet_size", 1024 * 1024)?
            .set_default("grafana.timeout", "10s")?;

        if let Some(path) = path {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("mqtt.topics")
                    .with_list_parse_key("grafana.tags")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for running the bridge
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        self.grafana.validate()?;
        Ok(())
    }

    /// Name used as MQTT client id and in lifecycle annotations
    pub fn client_identity(&self) -> String {
        match self.mqtt.client_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => program_name(),
        }
    }
}

/// Base name of the running executable, or `unknown`
pub fn program_name() -> String {
    let name = std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()));

    match name {
        Some(name) => name,
        None => {
            tracing::warn!("Could not determine program name; using 'unknown'");
            "unknown".to_string()
        }
    }
}
