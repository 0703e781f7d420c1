//! Server configuration.
//!
//! Loaded from a TOML file or built programmatically. Validation happens in
//! a separate step so configs constructed by hand go through the same
//! checks as configs read from disk.

use crate::error::ServerError;
use io_reactor::DEFAULT_MAX_POOL_BYTES;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;

/// Minimum accepted idle timeout.
pub const MIN_IDLE_TIMEOUT_MS: u64 = 1000;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identifier used in logs.
    #[serde(default = "default_name")]
    pub name: String,

    /// IPv4 dotted quad to bind.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    /// Listening port. Zero is rejected.
    pub port: u16,

    /// Number of worker loops. Zero means the base loop is the sole worker;
    /// unset defaults to the number of CPUs.
    #[serde(default)]
    pub io_thread_count: Option<usize>,

    /// Idle timeout applied when idle management is enabled.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Whether the idle timeout manager starts with the server.
    #[serde(default)]
    pub idle_timeout_enabled: bool,

    /// Chunk pool byte budget (e.g., "128MB").
    #[serde(
        default = "default_pool_max_bytes",
        deserialize_with = "deserialize_size"
    )]
    pub pool_max_bytes: usize,

    /// Logging configuration for [`crate::logging::init`].
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default level filter; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event's module target.
    #[serde(default)]
    pub target: bool,

    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: true,
        }
    }
}

fn default_name() -> String {
    "tcp-server".to_string()
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_pool_max_bytes() -> usize {
    DEFAULT_MAX_POOL_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Deserialize a size string like "64MB" or a plain byte count.
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64MB" or "4GiB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config, ServerError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.port == 0 {
            return Err(ServerError::Config("port cannot be 0".to_string()));
        }
        self.parsed_listen_ip()?;
        if self.idle_timeout_ms < MIN_IDLE_TIMEOUT_MS {
            return Err(ServerError::Config(format!(
                "idle_timeout_ms ({}) must be at least {}",
                self.idle_timeout_ms, MIN_IDLE_TIMEOUT_MS
            )));
        }
        if self.pool_max_bytes == 0 {
            return Err(ServerError::Config(
                "pool_max_bytes cannot be 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn parsed_listen_ip(&self) -> Result<Ipv4Addr, ServerError> {
        self.listen_ip
            .parse()
            .map_err(|_| ServerError::Config(format!("invalid listen_ip: {}", self.listen_ip)))
    }

    /// The number of worker loops to start.
    pub fn io_threads(&self) -> usize {
        self.io_thread_count.unwrap_or_else(num_cpus::get)
    }
}
