//! Configuration management for graphstep.
//!
//! Two kinds of configuration exist:
//!
//! - [`DbConfig`]: the connection object passed to every operation
//!   (`{host, database, user: {name, password}}`), as JSON or YAML.
//! - [`Config`]: client and estimate tunables, loaded with the following
//!   priority:
//!   1. Environment variables (highest priority)
//!   2. Project-local `graphstep.toml` file
//!   3. User config `~/.config/graphstep/config.toml`
//!   4. Built-in defaults (lowest priority)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod defaults;

pub use defaults::*;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to parse database config: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to parse database config: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Database connection
// ============================================================================

/// Credentials for the graph store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub name: String,
    pub password: String,
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("name", &self.name)
            .field("password", &"***")
            .finish()
    }
}

/// Connection parameters for one database.
///
/// Unknown fields are ignored. Besides the canonical layout the legacy
/// `database_name` / `credentials {user, password}` layout is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDbConfig")]
pub struct DbConfig {
    /// Base URL of the store, e.g. `http://localhost:7474`.
    pub host: String,
    /// Database name; every operation is scoped to it.
    pub database: String,
    pub user: UserCredentials,
}

#[derive(Deserialize)]
struct RawDbConfig {
    host: String,
    #[serde(alias = "database_name")]
    database: String,
    user: Option<UserCredentials>,
    credentials: Option<LegacyCredentials>,
}

#[derive(Deserialize)]
struct LegacyCredentials {
    user: String,
    password: String,
}

impl TryFrom<RawDbConfig> for DbConfig {
    type Error = String;

    fn try_from(raw: RawDbConfig) -> Result<Self, Self::Error> {
        let user = match (raw.user, raw.credentials) {
            (Some(user), _) => user,
            (None, Some(legacy)) => UserCredentials {
                name: legacy.user,
                password: legacy.password,
            },
            (None, None) => return Err("missing field `user`".to_string()),
        };
        Ok(Self {
            host: raw.host,
            database: raw.database,
            user,
        })
    }
}

impl DbConfig {
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
            user: UserCredentials {
                name: user.into(),
                password: password.into(),
            },
        }
    }

    /// Parse the JSON form.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: DbConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DbConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Read the JSON form from `GRAPHSTEP_DB`, if set.
    pub fn from_env() -> Option<Result<Self, ConfigError>> {
        std::env::var(DB_CONFIG_ENV).ok().map(|json| Self::from_json(&json))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::Invalid("database must not be empty".into()));
        }
        Ok(())
    }

    /// Host without trailing slashes.
    pub fn base_url(&self) -> &str {
        self.host.trim_end_matches('/')
    }
}

// ============================================================================
// Tunables
// ============================================================================

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Graph store client behaviour.
    pub client: ClientConfig,

    /// Transfer-time estimate parameters.
    pub estimate: EstimateConfig,
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Searches for config in order:
    /// 1. `./graphstep.toml` (project local)
    /// 2. `~/.config/graphstep/config.toml` (user config)
    /// 3. Falls back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        if Path::new(LOCAL_CONFIG_FILE).exists() {
            return Self::from_file(LOCAL_CONFIG_FILE);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join(USER_CONFIG_DIR).join(USER_CONFIG_FILE);
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content)?;

        // Apply environment variable overrides
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        // Client overrides
        if let Some(n) = parsed("GRAPHSTEP_REQUEST_TIMEOUT_SECS") {
            self.client.request_timeout_secs = n;
        }
        if let Some(n) = parsed("GRAPHSTEP_CONNECT_TIMEOUT_SECS") {
            self.client.connect_timeout_secs = n;
        }
        if let Some(n) = parsed("GRAPHSTEP_MAX_ATTEMPTS") {
            self.client.max_attempts = n;
        }
        if let Some(n) = parsed("GRAPHSTEP_INITIAL_BACKOFF_MS") {
            self.client.initial_backoff_ms = n;
        }
        if let Some(n) = parsed("GRAPHSTEP_MAX_BACKOFF_MS") {
            self.client.max_backoff_ms = n;
        }

        // Estimate overrides
        if let Some(n) = parsed("GRAPHSTEP_UPLOAD_BYTES_PER_SEC") {
            self.estimate.upload_bytes_per_sec = n;
        }
        if let Some(n) = parsed("GRAPHSTEP_DOWNLOAD_BYTES_PER_SEC") {
            self.estimate.download_bytes_per_sec = n;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.client.max_attempts == 0 {
            return Err(ConfigError::Invalid("client.max_attempts must be at least 1".into()));
        }
        if self.estimate.upload_bytes_per_sec <= 0.0 || self.estimate.download_bytes_per_sec <= 0.0 {
            return Err(ConfigError::Invalid("estimate throughput must be positive".into()));
        }
        Ok(())
    }

    /// Create a default config file content as a string.
    pub fn default_config_string() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Graph store client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout for a single request, in seconds.
    pub request_timeout_secs: u64,

    /// Timeout for establishing a connection, in seconds.
    pub connect_timeout_secs: u64,

    /// Attempts before a transient failure is reported.
    pub max_attempts: u32,

    /// First retry delay in milliseconds.
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based), doubling up to the ceiling.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

/// Transfer-time estimate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateConfig {
    /// Upload throughput in bytes per second.
    pub upload_bytes_per_sec: f64,

    /// Download throughput in bytes per second.
    pub download_bytes_per_sec: f64,

    /// Average size of one node with its payload, in bytes.
    pub avg_node_bytes: f64,

    /// Average size of one relationship, in bytes.
    pub avg_edge_bytes: f64,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            upload_bytes_per_sec: DEFAULT_UPLOAD_BYTES_PER_SEC,
            download_bytes_per_sec: DEFAULT_DOWNLOAD_BYTES_PER_SEC,
            avg_node_bytes: DEFAULT_AVG_NODE_BYTES,
            avg_edge_bytes: DEFAULT_AVG_EDGE_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_json() {
        let config = DbConfig::from_json(
            r#"{"host":"http://localhost:7474/","database":"neo4j","user":{"name":"neo4j","password":"secret"},"extra":1}"#,
        )
        .unwrap();
        assert_eq!(config.database, "neo4j");
        assert_eq!(config.user.name, "neo4j");
        assert_eq!(config.base_url(), "http://localhost:7474");
    }

    #[test]
    fn test_db_config_missing_user() {
        assert!(DbConfig::from_json(r#"{"host":"http://h","database":"d"}"#).is_err());
    }

    #[test]
    fn test_db_config_empty_host() {
        let err = DbConfig::from_json(r#"{"host":" ","database":"d","user":{"name":"u","password":"p"}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_password_is_redacted() {
        let config = DbConfig::new("http://h", "d", "u", "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let client = ClientConfig::default();
        assert_eq!(client.backoff(1), Duration::from_millis(250));
        assert_eq!(client.backoff(2), Duration::from_millis(500));
        assert_eq!(client.backoff(3), Duration::from_millis(1000));
        assert_eq!(client.backoff(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_default_config_string_parses() {
        let text = Config::default_config_string();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.client.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }
}
