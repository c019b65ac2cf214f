use chrono::NaiveTime;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 3000;
const CONFIG_DIR: &str = "config";
const DEFAULT_MAIL_FROM: &str = "ERP App <noreply@erp.local>";
const DEV_DEFAULT_JWT_SECRET: &str = "dev_only_jwt_secret_replace_me_before_deploying_anywhere_real";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// HS256 secret used to verify bearer tokens
    #[validate(length(min = 32), custom = "validate_jwt_secret")]
    pub jwt_secret: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Number of order-processing workers polling the job table
    #[serde(default = "default_queue_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub queue_concurrency: usize,

    /// Idle poll interval for workers (milliseconds)
    #[serde(default = "default_queue_poll_interval_ms")]
    #[validate(range(min = 10))]
    pub queue_poll_interval_ms: u64,

    /// Completed jobs retained per queue
    #[serde(default = "default_queue_remove_on_complete")]
    pub queue_remove_on_complete: u64,

    /// Failed jobs retained per queue
    #[serde(default = "default_queue_remove_on_fail")]
    pub queue_remove_on_fail: u64,

    /// Seconds an active job may run before another worker reclaims it
    #[serde(default = "default_queue_stall_timeout_secs")]
    #[validate(range(min = 1))]
    pub queue_stall_timeout_secs: u64,

    /// Default sender for outgoing mail
    #[serde(default = "default_mail_from")]
    pub mail_from: String,

    /// Mail transport: only "log" is bundled
    #[serde(default = "default_mail_transport")]
    #[validate(custom = "validate_mail_transport")]
    pub mail_transport: String,

    /// Run the daily sweeps in this process
    #[serde(default = "default_true_bool")]
    pub scheduler_enabled: bool,

    /// Local time of day (HH:MM) for the overdue-invoice sweep
    #[serde(default = "default_overdue_sweep_at")]
    #[validate(custom = "validate_time_of_day")]
    pub overdue_sweep_at: String,

    /// Local time of day (HH:MM) for the low-stock sweep
    #[serde(default = "default_low_stock_sweep_at")]
    #[validate(custom = "validate_time_of_day")]
    pub low_stock_sweep_at: String,
}

impl AppConfig {
    /// Builds a configuration with defaults for every tunable, mainly for tests and tooling.
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            jwt_secret,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            queue_concurrency: default_queue_concurrency(),
            queue_poll_interval_ms: default_queue_poll_interval_ms(),
            queue_remove_on_complete: default_queue_remove_on_complete(),
            queue_remove_on_fail: default_queue_remove_on_fail(),
            queue_stall_timeout_secs: default_queue_stall_timeout_secs(),
            mail_from: default_mail_from(),
            mail_transport: default_mail_transport(),
            scheduler_enabled: true,
            overdue_sweep_at: default_overdue_sweep_at(),
            low_stock_sweep_at: default_low_stock_sweep_at(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
            || self.environment.eq_ignore_ascii_case("test")
    }

    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|o| !o.trim().is_empty()))
            .unwrap_or(false)
    }

    pub fn should_allow_permissive_cors(&self) -> bool {
        self.cors_allow_any_origin || self.is_development()
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Parsed time of day for the overdue sweep.
    pub fn overdue_sweep_time(&self) -> Result<NaiveTime, AppConfigError> {
        parse_time_of_day(&self.overdue_sweep_at)
            .ok_or_else(|| AppConfigError::InvalidValue("overdue_sweep_at".into()))
    }

    /// Parsed time of day for the low-stock sweep.
    pub fn low_stock_sweep_time(&self) -> Result<NaiveTime, AppConfigError> {
        parse_time_of_day(&self.low_stock_sweep_at)
            .ok_or_else(|| AppConfigError::InvalidValue("low_stock_sweep_at".into()))
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development. Set APP__JWT_SECRET to a unique value."
                    .into(),
            );
            errors.add("jwt_secret", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid value for {0}")]
    InvalidValue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_queue_concurrency() -> usize {
    2
}
fn default_queue_poll_interval_ms() -> u64 {
    500
}
fn default_queue_remove_on_complete() -> u64 {
    100
}
fn default_queue_remove_on_fail() -> u64 {
    50
}
fn default_queue_stall_timeout_secs() -> u64 {
    300
}
fn default_mail_from() -> String {
    DEFAULT_MAIL_FROM.to_string()
}
fn default_mail_transport() -> String {
    "log".to_string()
}
fn default_true_bool() -> bool {
    true
}
fn default_overdue_sweep_at() -> String {
    "00:00".to_string()
}
fn default_low_stock_sweep_at() -> String {
    "09:00".to_string()
}

fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_mail_transport(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "log" => Ok(()),
        _ => {
            let mut err = ValidationError::new("mail_transport");
            err.message = Some("Must be one of: log".into());
            Err(err)
        }
    }
}

fn validate_time_of_day(value: &str) -> Result<(), ValidationError> {
    if parse_time_of_day(value).is_some() {
        Ok(())
    } else {
        let mut err = ValidationError::new("time_of_day");
        err.message = Some("Expected a 24h time of day formatted as HH:MM".into());
        Err(err)
    }
}

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();

    const DISALLOWED: [&str; 3] = ["your-secret-key", "default-secret-key", "changeme"];
    if DISALLOWED
        .iter()
        .any(|&bad| trimmed.eq_ignore_ascii_case(bad))
    {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("JWT secret must be overridden with a secure random value".into());
        return Err(err);
    }

    let unique_chars: std::collections::HashSet<char> = trimmed.chars().collect();
    if unique_chars.len() < 10 {
        let mut err = ValidationError::new("jwt_secret");
        err.message =
            Some("JWT secret must have at least 10 unique characters for adequate entropy".into());
        return Err(err);
    }

    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("erp_fulfillment={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://erp.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET or add jwt_secret to config/{run_env}.toml");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
