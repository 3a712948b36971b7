//! Configuration loading from TOML files and environment variables.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::DaemonError;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub generator: GeneratorConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix socket path for receiving handoffs from Apache.
    pub socket_path: String,

    /// Socket file permissions (octal).
    #[serde(deserialize_with = "deserialize_mode")]
    pub socket_mode: u32,

    /// Maximum concurrent streams.
    pub max_connections: usize,

    /// Timeout for receiving handoff from Apache (seconds).
    pub handoff_timeout_secs: u64,

    /// Timeout for individual writes to the client (seconds).
    pub write_timeout_secs: u64,

    /// Fail a stream when the generator is silent this long (seconds, 0 = never).
    pub idle_timeout_secs: u64,

    /// Graceful shutdown timeout (seconds).
    pub shutdown_timeout_secs: u64,

    /// Buffer size for receiving handoff data.
    pub handoff_buffer_size: usize,

    /// Events a generator may queue ahead of the client.
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: "/var/run/sse-bridged.sock".to_string(),
            socket_mode: 0o666,
            max_connections: 10_000,
            handoff_timeout_secs: 5,
            write_timeout_secs: 30,
            idle_timeout_secs: 60,
            shutdown_timeout_secs: 120,
            handoff_buffer_size: 65536,
            event_buffer: 64,
        }
    }
}

impl ServerConfig {
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_secs(self.handoff_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Generation collaborator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Provider: "mock" or "openai".
    pub provider: String,

    /// Upstream request timeout (seconds).
    pub timeout_secs: u64,

    pub mock: MockConfig,

    pub openai: OpenAIConfig,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            timeout_secs: 120,
            mock: MockConfig::default(),
            openai: OpenAIConfig::default(),
        }
    }
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Delay between tokens (milliseconds).
    pub token_delay_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self { token_delay_ms: 50 }
    }
}

/// OpenAI-compatible upstream settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAIConfig {
    /// API key (can also be set via OPENAI_API_KEY env var).
    pub api_key: Option<String>,

    /// API base URL.
    pub api_base: String,

    /// Model requested for every generation.
    pub model: String,

    /// Maximum idle connections per host in pool.
    pub pool_max_idle_per_host: usize,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            pool_max_idle_per_host: 100,
        }
    }
}

/// Metrics/Prometheus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn").
    pub level: String,

    /// Output format: "pretty" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DaemonError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DaemonError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        toml::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file, then apply environment variable overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, DaemonError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BRIDGE_SOCKET_PATH") {
            self.server.socket_path = v;
        }
        override_parsed("BRIDGE_MAX_CONNECTIONS", &mut self.server.max_connections);
        override_parsed("BRIDGE_WRITE_TIMEOUT", &mut self.server.write_timeout_secs);
        override_parsed("BRIDGE_IDLE_TIMEOUT", &mut self.server.idle_timeout_secs);

        if let Ok(v) = std::env::var("BRIDGE_GENERATOR") {
            self.generator.provider = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.generator.openai.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("OPENAI_API_BASE") {
            self.generator.openai.api_base = v;
        }

        if let Ok(v) = std::env::var("BRIDGE_METRICS_ENABLED") {
            self.metrics.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("BRIDGE_METRICS_ADDR") {
            self.metrics.listen_addr = v;
        }

        if let Ok(v) = std::env::var("BRIDGE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("BRIDGE_LOG_FORMAT") {
            self.logging.format = v;
        }
    }
}

/// Replace `slot` with the parsed env var, ignoring unparsable values.
fn override_parsed<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(var) {
        match v.parse() {
            Ok(n) => *slot = n,
            Err(_) => tracing::warn!(var, value = %v, "Ignoring unparsable override"),
        }
    }
}

/// Deserialize socket mode from various formats (octal string, decimal).
fn deserialize_mode<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ModeValue {
        Number(u32),
        String(String),
    }

    match ModeValue::deserialize(deserializer)? {
        ModeValue::Number(n) => Ok(n),
        ModeValue::String(s) => {
            let s = s.trim();
            if let Some(stripped) = s.strip_prefix("0o") {
                u32::from_str_radix(stripped, 8).map_err(D::Error::custom)
            } else if s.starts_with('0') && s.len() > 1 {
                u32::from_str_radix(s, 8).map_err(D::Error::custom)
            } else {
                s.parse().map_err(D::Error::custom)
            }
        }
    }
}
