//! Configuration module for the switchboard gateway.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3001
//!
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [gateway]
//! default_room = "all"
//! topic_prefix = "task-events"
//!
//! [cache]
//! ttl_secs = 5
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::Backoff;
use crate::gateway::{validate_room, DEFAULT_ROOM, DEFAULT_SEND_BUFFER, DEFAULT_TOPIC_PREFIX};
use crate::query::DEFAULT_KEY_PREFIX;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// HTTP listener
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3001
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Gateway instance settings
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Identifies this instance on the bus; defaults to `gateway-<hostname>`
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Room joined on connect. Empty disables auto-join.
    #[serde(default = "default_room")]
    pub default_room: String,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Frames buffered per session
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            default_room: default_room(),
            topic_prefix: default_topic_prefix(),
            send_buffer: default_send_buffer(),
        }
    }
}

impl GatewayConfig {
    /// Configured instance id, else one derived from the hostname, else a
    /// random one.
    pub fn resolve_instance_id(&self) -> String {
        if let Some(id) = self.instance_id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        match hostname::get().ok().and_then(|h| h.into_string().ok()) {
            Some(host) if !host.is_empty() => format!("gateway-{}", host),
            _ => format!("gateway-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn default_room(&self) -> Option<String> {
        (!self.default_room.is_empty()).then(|| self.default_room.clone())
    }
}

fn default_room() -> String {
    DEFAULT_ROOM.to_string()
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_send_buffer() -> usize {
    DEFAULT_SEND_BUFFER
}

/// Bus reconnect backoff
#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl BusConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    3000
}

/// List cache settings
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_ttl_secs() -> u64 {
    5
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl SwitchboardConfig {
    /// Load configuration from the default path or SWITCHBOARD_CONFIG env var.
    ///
    /// `REDIS_URL`, when set, overrides the configured Redis URL.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = env::var("SWITCHBOARD_CONFIG")
            .unwrap_or_else(|_| "config/switchboard.toml".to_string());

        let mut config = Self::load_from(&config_path)?;
        if let Ok(url) = env::var("REDIS_URL") {
            debug!("REDIS_URL overrides configured Redis URL");
            config.redis.url = url;
            config.validate()?;
        }
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content)?;

        info!(
            port = config.server.port,
            topic_prefix = %config.gateway.topic_prefix,
            default_room = %config.gateway.default_room,
            cache_ttl_secs = config.cache.ttl_secs,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate TOML text, substituting `${VAR}` references.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: SwitchboardConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.redis.url;
        if url.contains("${") {
            warn!(url = %url, "Redis URL contains unsubstituted environment variable");
        }
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ConfigError::ValidationError(
                "Redis URL must start with redis:// or rediss://".to_string(),
            ));
        }

        let gateway = &self.gateway;
        if gateway.topic_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "gateway.topic_prefix must not be empty".to_string(),
            ));
        }
        if gateway.send_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "gateway.send_buffer must be at least 1".to_string(),
            ));
        }
        if !gateway.default_room.is_empty() && validate_room(&gateway.default_room).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "gateway.default_room {:?} is not a valid room name",
                gateway.default_room
            )));
        }

        if self.bus.backoff_base_ms == 0 || self.bus.backoff_max_ms < self.bus.backoff_base_ms {
            return Err(ConfigError::ValidationError(
                "bus backoff must satisfy 0 < backoff_base_ms <= backoff_max_ms".to_string(),
            ));
        }

        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cache.ttl_secs must be at least 1".to_string(),
            ));
        }
        if self.cache.key_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "cache.key_prefix must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap_or_else(|e| unreachable!("{}", e))
    })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("SWITCHBOARD_TEST_VAR", "substituted_value");
        let input = "url = \"${SWITCHBOARD_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("SWITCHBOARD_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = SwitchboardConfig::parse(
            r#"
            [server]
            port = 4000
        "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.gateway.topic_prefix, "task-events");
    }

    #[test]
    fn test_parse_gateway_section() {
        let config = SwitchboardConfig::parse(
            r#"
            [gateway]
            instance_id = "gw-east-1"
            default_room = ""
            topic_prefix = "kanban"
            send_buffer = 32

            [bus]
            backoff_base_ms = 50
            backoff_max_ms = 2000

            [cache]
            ttl_secs = 3
            key_prefix = "board"
        "#,
        )
        .unwrap();

        assert_eq!(config.gateway.resolve_instance_id(), "gw-east-1");
        assert_eq!(config.gateway.default_room(), None);
        assert_eq!(config.gateway.send_buffer, 32);
        assert_eq!(config.bus.backoff().next_delay(), Duration::from_millis(50));
        assert_eq!(config.cache.ttl(), Duration::from_secs(3));
        assert_eq!(config.cache.key_prefix, "board");
    }

    #[test]
    fn test_default_config() {
        let config = SwitchboardConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.gateway.default_room(), Some("all".to_string()));
        assert_eq!(config.gateway.send_buffer, 256);
        assert_eq!(config.bus.backoff_max_ms, 3000);
        assert_eq!(config.cache.ttl(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_instance_id_fallback() {
        let config = GatewayConfig::default();
        let id = config.resolve_instance_id();
        assert!(id.starts_with("gateway-"));
        assert!(id.len() > "gateway-".len());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = SwitchboardConfig::load_from("/nonexistent/switchboard.toml").unwrap();
        assert_eq!(config.server.port, 3001);
    }

    #[test]
    fn test_validation_invalid_url() {
        let result = SwitchboardConfig::parse(
            r#"
            [redis]
            url = "http://localhost:6379"
        "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        for toml in [
            "[gateway]\ntopic_prefix = \"\"",
            "[gateway]\nsend_buffer = 0",
            "[gateway]\ndefault_room = \"two words\"",
            "[bus]\nbackoff_base_ms = 500\nbackoff_max_ms = 100",
            "[cache]\nttl_secs = 0",
        ] {
            assert!(SwitchboardConfig::parse(toml).is_err(), "accepted: {}", toml);
        }
    }
}
