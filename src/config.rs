use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;
use thiserror::Error;
use validator::Validate;

const DEFAULT_ENV: &str = "development";
const DEFAULT_LOG_LEVEL: &str = "info";
const CONFIG_DIR: &str = "config";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_LOW_THRESHOLD: i32 = 10;
const DEFAULT_CRITICAL_THRESHOLD: i32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Connection pool settings.
#[derive(Clone, Debug, Deserialize)]
pub struct DbSettings {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
        }
    }
}

/// Availability thresholds used by stock classification. A product is "low"
/// when available stock is at or below `low`, "critical" at or below
/// `critical`, "negative" below zero.
#[derive(Clone, Debug, Deserialize)]
pub struct StockThresholds {
    #[serde(default = "default_low_threshold")]
    pub low: i32,
    #[serde(default = "default_critical_threshold")]
    pub critical: i32,
}

impl Default for StockThresholds {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_THRESHOLD,
            critical: DEFAULT_CRITICAL_THRESHOLD,
        }
    }
}

/// Application configuration, layered from `config/default`, then
/// `config/{environment}`, then `STOCKLINE_*` environment variables
/// (double-underscore separator for nested keys, e.g.
/// `STOCKLINE_STOCK__LOW=5`).
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(length(min = 1, message = "database_url is required"))]
    pub database_url: String,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub db: DbSettings,

    #[serde(default)]
    pub stock: StockThresholds,
}

impl AppConfig {
    /// Minimal configuration around a database URL, defaults elsewhere.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            environment: DEFAULT_ENV.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            db: DbSettings::default(),
            stock: StockThresholds::default(),
        }
    }

    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            env::var("STOCKLINE_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let settings = Config::builder()
            .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
            .add_source(
                File::with_name(&format!("{}/{}", CONFIG_DIR, environment)).required(false),
            )
            .add_source(Environment::with_prefix("STOCKLINE").separator("__"))
            .build()?;

        let mut config: AppConfig = settings.try_deserialize()?;
        config.environment = environment;

        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if config.stock.critical > config.stock.low {
            return Err(ConfigError::Invalid(format!(
                "stock.critical ({}) must not exceed stock.low ({})",
                config.stock.critical, config.stock.low
            )));
        }

        Ok(config)
    }
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_min_connections() -> u32 {
    DEFAULT_MIN_CONNECTIONS
}

fn default_low_threshold() -> i32 {
    DEFAULT_LOW_THRESHOLD
}

fn default_critical_threshold() -> i32 {
    DEFAULT_CRITICAL_THRESHOLD
}
