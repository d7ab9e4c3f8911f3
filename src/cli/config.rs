//! Configuration management for warehouse-mcp
//!
//! Provides TOML-based configuration with defaults and validation.
//! Location: ~/.warehouse-mcp/config.toml

use crate::errors::{BridgeError, Result};
use crate::pool::PoolConfig;
use crate::query::ExecutorConfig;
use crate::server::protocol::ServerInfo;
use crate::server::ServerOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration for warehouse-mcp
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub warehouse: WarehouseConfig,
    pub pool: PoolSection,
    pub query: QuerySection,
    pub server: ServerSection,
}

/// TLS negotiation with the warehouse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SslModeSetting {
    Disable,
    Prefer,
    Require,
}

/// Warehouse connection settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,

    /// Never written back to disk
    #[serde(skip_serializing)]
    pub password: Option<String>,

    pub sslmode: SslModeSetting,

    /// Extra PEM root certificate trusted in addition to the system roots
    pub ssl_root_cert: Option<PathBuf>,

    pub connect_timeout_sec: u64,
    pub application_name: String,
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_connections: usize,
    pub min_connections: usize,
    pub acquire_timeout_ms: u64,
    pub max_idle_sec: u64,
    /// 0 disables the health check
    pub health_check_after_sec: u64,
    pub reaper_interval_sec: u64,
}

/// Query execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySection {
    pub fetch_batch_size: usize,
    pub max_rows: usize,
    /// 0 means no statement timeout
    pub statement_timeout_sec: u64,
    pub read_only: bool,
}

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub shutdown_grace_sec: u64,
    /// 0 means calls carry no deadline of their own
    pub request_timeout_sec: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5439,
            database: "dev".to_string(),
            user: "awsuser".to_string(),
            password: None,
            sslmode: SslModeSetting::Require,
            ssl_root_cert: None,
            connect_timeout_sec: 10,
            application_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

impl fmt::Debug for WarehouseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("sslmode", &self.sslmode)
            .field("ssl_root_cert", &self.ssl_root_cert)
            .field("connect_timeout_sec", &self.connect_timeout_sec)
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections: 8,
            min_connections: 1,
            acquire_timeout_ms: 30_000,
            max_idle_sec: 300,
            health_check_after_sec: 60,
            reaper_interval_sec: 30,
        }
    }
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            fetch_batch_size: 500,
            max_rows: 10_000,
            statement_timeout_sec: 120,
            read_only: false,
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            shutdown_grace_sec: 10,
            request_timeout_sec: 0,
        }
    }
}

fn config_error(message: impl Into<String>) -> BridgeError {
    BridgeError::Config(message.into())
}

fn non_zero(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

impl Config {
    /// Load configuration from file or use defaults
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        if let Some(config_path) = path {
            Self::load_from_file(&config_path)
        } else {
            Self::load_default()
        }
    }

    /// Load configuration from specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("Failed to read config {}: {}", path.display(), e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| config_error(format!("Failed to parse config: {}", e)))?;

        if let Some(cert) = &config.warehouse.ssl_root_cert {
            config.warehouse.ssl_root_cert = Some(Self::expand_path(&cert.to_string_lossy()));
        }
        Ok(config)
    }

    /// Standard config location
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".warehouse-mcp").join("config.toml"))
    }

    /// Load default configuration from standard location or use built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Some(config_path) = Self::default_path() {
            if config_path.exists() {
                return Self::load_from_file(&config_path);
            }
        }

        Ok(Config::default())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("warehouse.host", &self.warehouse.host),
            ("warehouse.database", &self.warehouse.database),
            ("warehouse.user", &self.warehouse.user),
        ] {
            if value.trim().is_empty() {
                return Err(config_error(format!("{} must not be empty", field)));
            }
        }

        if self.pool.max_connections == 0 {
            return Err(config_error("pool.max_connections must be greater than 0"));
        }

        if self.pool.min_connections > self.pool.max_connections {
            return Err(config_error(
                "pool.min_connections must not exceed pool.max_connections",
            ));
        }

        if self.query.fetch_batch_size == 0 {
            return Err(config_error("query.fetch_batch_size must be greater than 0"));
        }

        if self.query.max_rows == 0 {
            return Err(config_error("query.max_rows must be greater than 0"));
        }

        Ok(())
    }

    /// Save configuration to file (the password is never written)
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| config_error(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| config_error(format!("Failed to create config dir: {}", e)))?;
        }

        std::fs::write(path, contents)
            .map_err(|e| config_error(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Effective configuration as TOML, password shown only as redacted
    pub fn redacted_toml(&self) -> Result<String> {
        let mut rendered = toml::to_string_pretty(self)
            .map_err(|e| config_error(format!("Failed to serialize config: {}", e)))?;
        if self.warehouse.password.is_some() {
            rendered = rendered.replacen(
                "[warehouse]\n",
                "[warehouse]\npassword = \"<redacted>\"\n",
                1,
            );
        }
        Ok(rendered)
    }

    /// Expand tilde in paths
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.pool.max_connections,
            min_connections: self.pool.min_connections,
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            max_idle: Duration::from_secs(self.pool.max_idle_sec),
            health_check_after: non_zero(self.pool.health_check_after_sec),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            fetch_batch_size: self.query.fetch_batch_size,
            max_rows: self.query.max_rows,
            default_statement_timeout: non_zero(self.query.statement_timeout_sec),
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            request_timeout: non_zero(self.server.request_timeout_sec),
            shutdown_grace: Duration::from_secs(self.server.shutdown_grace_sec),
            info: ServerInfo::default(),
        }
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.pool.reaper_interval_sec.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.warehouse.port, 5439);
        assert_eq!(config.warehouse.sslmode, SslModeSetting::Require);
        assert_eq!(config.query.fetch_batch_size, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[warehouse]\nhost = \"example.redshift.amazonaws.com\"\nsslmode = \"disable\"\n\n[query]\nmax_rows = 50\n",
        )
        .unwrap();

        let config = Config::load(Some(path)).unwrap();
        assert_eq!(config.warehouse.host, "example.redshift.amazonaws.com");
        assert_eq!(config.warehouse.sslmode, SslModeSetting::Disable);
        assert_eq!(config.warehouse.port, 5439);
        assert_eq!(config.query.max_rows, 50);
        assert_eq!(config.pool.max_connections, 8);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = Config::load(Some(PathBuf::from("/nonexistent/warehouse.toml")));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.pool.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.min_connections = 9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.query.fetch_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.query.max_rows = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.warehouse.database = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_password_is_redacted() {
        let mut config = Config::default();
        config.warehouse.password = Some("hunter2".to_string());

        assert!(!format!("{:?}", config).contains("hunter2"));
        let rendered = config.redacted_toml().unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_save_never_writes_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.warehouse.password = Some("hunter2".to_string());

        config.save(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("hunter2"));
        assert!(Config::load_from_file(&path).unwrap().warehouse.password.is_none());
    }

    #[test]
    fn test_zero_disables_timeouts() {
        let mut config = Config::default();
        config.query.statement_timeout_sec = 0;
        config.pool.health_check_after_sec = 0;

        assert_eq!(config.executor_config().default_statement_timeout, None);
        assert_eq!(config.pool_config().health_check_after, None);
        assert_eq!(config.server_options().request_timeout, None);
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = "/absolute/path";
        assert_eq!(Config::expand_path(path).to_string_lossy(), path);
    }
}
