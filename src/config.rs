//! Configuration loading.
//!
//! A TOML file is deserialized into [`Config`], split into per-concern
//! sub-structs the way the rest of this ecosystem does it, with
//! `#[serde(default = "fn")]` defaults matched by a plain `impl Default`
//! so that every block is also valid when entirely absent from the file.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

fn default_bind() -> String {
    "0.0.0.0:6667".to_string()
}
fn default_server_name() -> String {
    "passerd".to_string()
}
fn default_network_name() -> String {
    "Passerd".to_string()
}
fn default_db_path() -> String {
    "passerd.sqlite3".to_string()
}
fn default_db_max_connections() -> u32 {
    5
}
fn default_acquire_timeout_secs() -> u64 {
    5
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_api_timeout_secs() -> u64 {
    60
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

/// `[server]` — listener and IRC-facing identity.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_network_name")]
    pub network: String,
    #[serde(default)]
    pub motd: MotdConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            name: default_server_name(),
            network: default_network_name(),
            motd: MotdConfig::default(),
        }
    }
}

/// MOTD lines, either inline or loaded from a file, falling back to a
/// built-in one-liner when neither is configured.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MotdConfig {
    pub file: Option<String>,
    #[serde(default)]
    pub lines: Vec<String>,
}

impl MotdConfig {
    pub fn load_lines(&self) -> Vec<String> {
        if let Some(path) = &self.file {
            match std::fs::read_to_string(path) {
                Ok(content) => return content.lines().map(str::to_string).collect(),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to read motd file, falling back");
                }
            }
        }
        if !self.lines.is_empty() {
            return self.lines.clone();
        }
        vec!["Welcome to passerd, a gateway between IRC and your timeline.".to_string()]
    }
}

/// `[database]`
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_db_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// `[remote]` — the abstract microblog API and delegated-auth endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    #[serde(default)]
    pub request_token_url: String,
    #[serde(default)]
    pub authorize_url: String,
    #[serde(default)]
    pub access_token_url: String,
    #[serde(default)]
    pub consumer_key: String,
    #[serde(default)]
    pub consumer_secret: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_timeout_secs: default_api_timeout_secs(),
            request_token_url: String::new(),
            authorize_url: String::new(),
            access_token_url: String::new(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
        }
    }
}

/// `[limits]` — the constants pinned by the spec, overridable for tests.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "Limits::default_max_reqs_per_hour")]
    pub max_reqs_per_hour: u32,
    #[serde(default = "Limits::default_query_count")]
    pub query_count: u32,
    #[serde(default = "Limits::default_length_limit")]
    pub length_limit: usize,
    #[serde(default = "Limits::default_reply_history_size")]
    pub reply_history_size: usize,
    #[serde(default = "Limits::default_min_latest_post_age_secs")]
    pub min_latest_post_age_secs: i64,
    #[serde(default = "Limits::default_max_friend_page_reqs")]
    pub max_friend_page_reqs: u32,
}

/// Plain struct mirroring [`LimitsConfig`]'s resolved values, handed to
/// runtime code that shouldn't need to know about serde defaults.
pub type Limits = LimitsConfig;

impl Limits {
    fn default_max_reqs_per_hour() -> u32 {
        80
    }
    fn default_query_count() -> u32 {
        100
    }
    fn default_length_limit() -> usize {
        140
    }
    fn default_reply_history_size() -> usize {
        100
    }
    fn default_min_latest_post_age_secs() -> i64 {
        2
    }
    fn default_max_friend_page_reqs() -> u32 {
        10
    }

    /// `REFRESH_DELAY ≈ 3600 / MAX_REQS_PER_HOUR` seconds per request slot.
    pub fn refresh_delay_secs(&self) -> f64 {
        3600.0 / self.max_reqs_per_hour as f64
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_reqs_per_hour: Self::default_max_reqs_per_hour(),
            query_count: Self::default_query_count(),
            length_limit: Self::default_length_limit(),
            reply_history_size: Self::default_reply_history_size(),
            min_latest_post_age_secs: Self::default_min_latest_post_age_secs(),
            max_friend_page_reqs: Self::default_max_friend_page_reqs(),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}

fn default_server() -> ServerConfig {
    ServerConfig::default()
}
fn default_database() -> DatabaseConfig {
    DatabaseConfig::default()
}
fn default_remote() -> RemoteConfig {
    RemoteConfig::default()
}
fn default_limits() -> LimitsConfig {
    LimitsConfig::default()
}
fn default_logging() -> LoggingConfig {
    LoggingConfig::default()
}

/// Top-level configuration, as loaded from `config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,
    #[serde(default = "default_database")]
    pub database: DatabaseConfig,
    #[serde(default = "default_remote")]
    pub remote: RemoteConfig,
    #[serde(default = "default_limits")]
    pub limits: LimitsConfig,
    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            database: default_database(),
            remote: default_remote(),
            limits: default_limits(),
            logging: default_logging(),
        }
    }
}

impl Config {
    /// Load and parse a TOML config file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// A boolean-truthy test for `config:*` UserVar values, per the truthy
    /// set pinned in the spec: `{true, t, 1, y, yes, on}`.
    pub fn is_truthy(value: &str) -> bool {
        matches!(
            value.to_ascii_lowercase().as_str(),
            "true" | "t" | "1" | "y" | "yes" | "on"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_pinned_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.limits.max_reqs_per_hour, 80);
        assert_eq!(cfg.limits.query_count, 100);
        assert_eq!(cfg.limits.length_limit, 140);
        assert_eq!(cfg.limits.reply_history_size, 100);
        assert_eq!(cfg.limits.max_friend_page_reqs, 10);
    }

    #[test]
    fn refresh_delay_is_45_seconds_at_default_budget() {
        let limits = LimitsConfig::default();
        assert!((limits.refresh_delay_secs() - 45.0).abs() < 0.1);
    }

    #[test]
    fn truthy_set_matches_spec() {
        for v in ["true", "t", "1", "y", "yes", "on", "TRUE", "On"] {
            assert!(Config::is_truthy(v), "{v} should be truthy");
        }
        for v in ["false", "0", "no", "off", "", "maybe"] {
            assert!(!Config::is_truthy(v), "{v} should not be truthy");
        }
    }

    #[test]
    fn empty_toml_loads_all_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:6667");
        assert_eq!(cfg.logging.format, "pretty");
    }

    #[test]
    fn motd_falls_back_to_builtin_when_unconfigured() {
        let motd = MotdConfig::default();
        assert_eq!(motd.load_lines().len(), 1);
    }
}
