//! Configuration management with environment variable support and validation.

use anyhow::{anyhow, Result};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_request_size_mb: usize,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            max_request_size_mb: 1,
            enable_cors: false,
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Search orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Process-wide bound on concurrent fetches and finalizations.
    pub worker_pool_size: usize,
    pub fetch_timeout_seconds: u64,
    /// Advisory delay returned to polling clients.
    pub poll_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            fetch_timeout_seconds: 60,
            poll_interval_ms: 1_500,
        }
    }
}

/// One product source backed by a catalog file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub catalog_path: PathBuf,
    #[serde(default)]
    pub latency_ms: u64,
}

/// One coupon source for the periodic refresher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponSourceConfig {
    pub name: String,
    pub catalog_path: PathBuf,
}

/// Periodic refresher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefresherConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub retry_interval_minutes: u64,
    pub max_retry_interval_minutes: u64,
    #[serde(default)]
    pub sources: Vec<CouponSourceConfig>,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 12,
            retry_interval_minutes: 60,
            max_retry_interval_minutes: 360,
            sources: Vec::new(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// sled directory; unset or empty keeps everything in memory.
    pub db_path: Option<String>,
}

/// Related-item ranking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankerConfig {
    pub max_results: usize,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self { max_results: 5 }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub refresher: RefresherConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ranker: RankerConfig,
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        Self::load_with(Self::environment())
    }

    /// `PCP_<SECTION>__<KEY>` variables, e.g. `PCP_SERVER__PORT=9000`.
    pub fn environment() -> Environment {
        Environment::with_prefix("PCP")
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("server.cors_origins")
            .try_parsing(true)
    }

    /// Layer the embedded defaults, a local `config` file and `env`.
    pub fn load_with(env: Environment) -> Result<Self> {
        let config = Config::builder()
            // Start with default settings
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            // Add local config file if it exists
            .add_source(config::File::with_name("config").required(false))
            // Add environment variables with PCP_ prefix
            .add_source(env)
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        Self::apply_env_overrides(&mut settings)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Short-form overrides for the settings operators touch most.
    fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
        if let Ok(host) = std::env::var("PCP_HOST") {
            settings.server.host = host;
        }
        if let Ok(port) = std::env::var("PCP_PORT") {
            settings.server.port = port.parse()?;
        }
        if let Ok(db_path) = std::env::var("PCP_DB_PATH") {
            settings.store.db_path = Some(db_path);
        }
        if let Ok(level) = std::env::var("PCP_LOG_LEVEL") {
            settings.logging.level = level;
        }

        Ok(())
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        if self.orchestrator.worker_pool_size == 0 {
            return Err(anyhow!("Worker pool size cannot be 0"));
        }
        if self.orchestrator.fetch_timeout_seconds == 0 {
            return Err(anyhow!("Fetch timeout cannot be 0"));
        }

        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(anyhow!("Source names cannot be empty"));
            }
            if !source.catalog_path.exists() {
                warn!("Catalog for source '{}' does not exist: {:?}", source.name, source.catalog_path);
            }
        }

        let refresher = &self.refresher;
        if refresher.enabled {
            if refresher.interval_hours == 0 || refresher.retry_interval_minutes == 0 {
                return Err(anyhow!("Refresher intervals cannot be 0"));
            }
            if refresher.retry_interval_minutes > refresher.interval_hours * 60 {
                return Err(anyhow!("Refresher retry interval cannot exceed the refresh interval"));
            }
            if refresher.max_retry_interval_minutes < refresher.retry_interval_minutes {
                warn!("Refresher max retry interval is below the retry interval; retry interval wins");
            }
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(anyhow!("Unknown log format '{}'", self.logging.format));
        }

        Ok(())
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_defaults_parse() {
        let settings: Settings = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.orchestrator.worker_pool_size, 4);
        assert_eq!(settings.sources.len(), 4);
        assert_eq!(settings.refresher.interval_hours, 12);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.orchestrator.worker_pool_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.refresher.retry_interval_minutes = 13 * 60;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.format = "xml".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_sectioned_env_variables_override() {
        let mut vars = config::Map::new();
        vars.insert(
            "PCP_ORCHESTRATOR__WORKER_POOL_SIZE".to_string(),
            "8".to_string(),
        );
        vars.insert("PCP_SERVER__PORT".to_string(), "9100".to_string());
        vars.insert(
            "PCP_SERVER__CORS_ORIGINS".to_string(),
            "http://a.test,http://b.test".to_string(),
        );

        let settings = Settings::load_with(Settings::environment().source(Some(vars))).unwrap();
        assert_eq!(settings.orchestrator.worker_pool_size, 8);
        assert_eq!(settings.server.cors_origins, vec!["http://a.test", "http://b.test"]);
        if std::env::var("PCP_PORT").is_err() {
            assert_eq!(settings.server.port, 9100);
        }
    }

    #[test]
    fn test_to_toml_round_trips() {
        let settings = Settings::default();
        let rendered = settings.to_toml().unwrap();
        let parsed: Settings = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, settings.server.port);
    }
}
