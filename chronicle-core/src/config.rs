//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/chronicle/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/chronicle/` (~/.config/chronicle/)
//! - State/Logs: `$XDG_STATE_HOME/chronicle/` (~/.local/state/chronicle/)
//!
//! A handful of environment variables override the file so the same binary
//! can be pointed at another backend without editing config:
//! `CHRONICLE_BACKEND`, `CHRONICLE_LOCAL_URL`, `CHRONICLE_CLOUD_URL`,
//! `CHRONICLE_CLOUD_ANON_KEY`.

use crate::backoff::ReconnectPolicy;
use crate::error::{Error, Result};
use crate::types::BackendKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Backend selection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Local server settings
    #[serde(default)]
    pub local: LocalConfig,

    /// Cloud project settings
    #[serde(default)]
    pub cloud: CloudConfig,

    /// Reconnection, heartbeat and health-check tuning
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Event cache sizing
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which backend to talk to
#[derive(Debug, Deserialize, Default, Clone)]
pub struct BackendConfig {
    #[serde(default)]
    pub mode: BackendKind,
}

/// Local Chronicle server
#[derive(Debug, Deserialize, Clone)]
pub struct LocalConfig {
    /// Base URL of the REST API; the socket lives at `{server_url}/ws`
    #[serde(default = "default_local_url")]
    pub server_url: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            server_url: default_local_url(),
        }
    }
}

fn default_local_url() -> String {
    "http://localhost:8510".to_string()
}

/// Hosted backend-as-a-service project
#[derive(Debug, Deserialize, Clone)]
pub struct CloudConfig {
    /// Project URL (e.g., `https://abcd.supabase.co`)
    pub url: Option<String>,

    /// Public anon key sent as `apikey` and bearer token
    pub anon_key: Option<String>,

    /// Database schema the tables live in
    #[serde(default = "default_schema")]
    pub schema: String,

    #[serde(default = "default_events_table")]
    pub events_table: String,

    #[serde(default = "default_sessions_table")]
    pub sessions_table: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            schema: default_schema(),
            events_table: default_events_table(),
            sessions_table: default_sessions_table(),
        }
    }
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_events_table() -> String {
    "chronicle_events".to_string()
}

fn default_sessions_table() -> String {
    "chronicle_sessions".to_string()
}

/// Connection resilience settings shared by both backends
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    /// Period of the background health probe; 0 disables it
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,

    /// Period of socket heartbeats; 0 disables them
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Automatic reconnects before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Delay before the first reconnect
    #[serde(default = "default_base_reconnect_delay")]
    pub base_reconnect_delay_ms: u64,

    /// Multiplier applied per attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on any reconnect delay
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_ms: u64,

    /// Deadline for REST calls, health probes and socket opens
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// How long a connected -> disconnected flip must persist to be shown
    #[serde(default = "default_status_debounce")]
    pub status_debounce_ms: u64,

    /// How long connecting must persist to be shown
    #[serde(default = "default_connecting_display_delay")]
    pub connecting_display_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            base_reconnect_delay_ms: default_base_reconnect_delay(),
            backoff_factor: default_backoff_factor(),
            max_reconnect_delay_ms: default_max_reconnect_delay(),
            request_timeout_ms: default_request_timeout(),
            status_debounce_ms: default_status_debounce(),
            connecting_display_delay_ms: default_connecting_display_delay(),
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_reconnect_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        non_zero(self.health_check_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        non_zero(self.heartbeat_interval_ms)
    }

    pub fn status_debounce(&self) -> Duration {
        Duration::from_millis(self.status_debounce_ms)
    }

    pub fn connecting_display_delay(&self) -> Duration {
        Duration::from_millis(self.connecting_display_delay_ms)
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn default_health_check_interval() -> u64 {
    30_000
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_base_reconnect_delay() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_reconnect_delay() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_status_debounce() -> u64 {
    300
}

fn default_connecting_display_delay() -> u64 {
    500
}

/// Event cache sizing
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Events kept in memory; older ones are evicted
    #[serde(default = "default_max_cached_events")]
    pub max_cached_events: usize,

    /// Events requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cached_events: default_max_cached_events(),
            page_size: default_page_size(),
        }
    }
}

fn default_max_cached_events() -> usize {
    1000
}

fn default_page_size() -> usize {
    100
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path, then apply env overrides
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Overlay `CHRONICLE_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(mode) = lookup("CHRONICLE_BACKEND") {
            match mode.parse() {
                Ok(kind) => self.backend.mode = kind,
                Err(e) => tracing::warn!(error = %e, "Ignoring CHRONICLE_BACKEND"),
            }
        }
        if let Some(url) = lookup("CHRONICLE_LOCAL_URL") {
            self.local.server_url = url;
        }
        if let Some(url) = lookup("CHRONICLE_CLOUD_URL") {
            self.cloud.url = Some(url);
        }
        if let Some(key) = lookup("CHRONICLE_CLOUD_ANON_KEY") {
            self.cloud.anon_key = Some(key);
        }
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        match self.backend.mode {
            BackendKind::Local => validate_http_url("local.server_url", &self.local.server_url)?,
            BackendKind::Cloud => {
                let url = self.cloud.url.as_deref().ok_or_else(|| {
                    Error::Config("cloud.url is required when backend.mode = \"cloud\"".to_string())
                })?;
                validate_http_url("cloud.url", url)?;
                if self.cloud.anon_key.as_deref().map_or(true, str::is_empty) {
                    return Err(Error::Config(
                        "cloud.anon_key is required when backend.mode = \"cloud\"".to_string(),
                    ));
                }
            }
        }

        let conn = &self.connection;
        if conn.backoff_factor.is_nan() || conn.backoff_factor < 1.0 {
            return Err(Error::Config(
                "connection.backoff_factor must be at least 1.0".to_string(),
            ));
        }
        if conn.request_timeout_ms == 0 {
            return Err(Error::Config(
                "connection.request_timeout_ms must be positive".to_string(),
            ));
        }
        if conn.max_reconnect_delay_ms < conn.base_reconnect_delay_ms {
            return Err(Error::Config(
                "connection.max_reconnect_delay_ms must not be below base_reconnect_delay_ms"
                    .to_string(),
            ));
        }
        if self.cache.max_cached_events == 0 || self.cache.page_size == 0 {
            return Err(Error::Config(
                "cache.max_cached_events and cache.page_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/chronicle/config.toml` (~/.config/chronicle/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("chronicle").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/chronicle/` (~/.local/state/chronicle/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("chronicle")
    }
}

fn validate_http_url(field: &str, raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| Error::Config(format!("{} is not a valid URL: {}", field, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::Config(format!(
            "{} must use http or https, not {}",
            field, other
        ))),
    }
}
