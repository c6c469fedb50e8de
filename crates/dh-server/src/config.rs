//! Server configuration loading from file and environment variables.

use dh_engine::{EngineConfig, EngineKind, RetryPolicy, DEFAULT_CACHE_TTL};
use dh_pipeline::PipelineSettings;
use dh_voice::EchoMimicSettings;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Which engine backs each pipeline stage.
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Per-engine parameter blocks, `[[engines.<kind>]]`.
    #[serde(default)]
    pub engines: EnginesConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub contexts: ContextsConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Talking-head video generation; absent disables the video routes.
    #[serde(default)]
    pub video: Option<EchoMimicSettings>,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted request body. Audio arrives base64-encoded.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "dh_pipeline=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnginesConfig {
    #[serde(default)]
    pub asr: Vec<EngineConfig>,
    #[serde(default)]
    pub llm: Vec<EngineConfig>,
    #[serde(default)]
    pub tts: Vec<EngineConfig>,
    #[serde(default)]
    pub agent: Vec<EngineConfig>,
}

impl EnginesConfig {
    /// Every configured block tagged with its kind, for the engine pool.
    pub fn catalog(&self) -> Vec<(EngineKind, EngineConfig)> {
        let tagged = |kind: EngineKind, blocks: &[EngineConfig]| {
            blocks
                .iter()
                .cloned()
                .map(move |config| (kind, config))
                .collect::<Vec<_>>()
        };
        let mut catalog = tagged(EngineKind::Asr, &self.asr);
        catalog.extend(tagged(EngineKind::Llm, &self.llm));
        catalog.extend(tagged(EngineKind::Tts, &self.tts));
        catalog.extend(tagged(EngineKind::Agent, &self.agent));
        catalog
    }
}

/// Synthesized-audio cache.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds between expiry sweeps; 0 disables the sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Conversation context retention.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextsConfig {
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,

    /// Seconds between stale-context sweeps; 0 disables the sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Upper bound on live contexts; unset means unbounded.
    #[serde(default)]
    pub max_contexts: Option<usize>,
}

impl ContextsConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_hours.saturating_mul(3600))
    }
}

/// Backoff for provider calls.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8000
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache/tts")
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL.as_secs()
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_max_age_hours() -> u64 {
    24
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_multiplier() -> u32 {
    2
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for ContextsConfig {
    fn default() -> Self {
        Self {
            max_age_hours: default_max_age_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_contexts: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Parses configuration from TOML text, without environment overrides.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    Ok(toml::from_str(contents)?)
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `DH_HOST` overrides `server.host`
/// - `DH_PORT` overrides `server.port`
/// - `DH_LOG_LEVEL` overrides `logging.level`
/// - `DH_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `DH_CACHE_DIR` overrides `cache.dir`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => parse_config(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("DH_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("DH_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(level) = std::env::var("DH_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("DH_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(dir) = std::env::var("DH_CACHE_DIR") {
        if !dir.trim().is_empty() {
            config.cache.dir = PathBuf::from(dir);
        }
    }

    Ok(config)
}
