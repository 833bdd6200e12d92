use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_RECONCILE_ATTEMPTS: u32 = 3;
const DEFAULT_INVENTORY_CLAIM_TTL_SECS: u64 = 300;
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 15;
const DEFAULT_NOTIFICATION_TIMEOUT_SECS: u64 = 10;

/// Sentinel database URL selecting the in-process order store
pub const MEMORY_DATABASE_URL: &str = "memory://";

/// Payment gateway client configuration
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Gateway API base URL (e.g. `https://cybqa.pesapal.com/pesapalv3`)
    #[validate(url)]
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub consumer_key: String,

    #[serde(default)]
    pub consumer_secret: String,

    /// Public URL of our IPN endpoint, registered with the gateway
    #[serde(default)]
    pub ipn_url: Option<String>,

    /// Notification id issued by the gateway for `ipn_url`
    #[serde(default)]
    pub ipn_id: Option<String>,

    /// Public URL of our browser callback endpoint
    #[serde(default)]
    pub callback_url: Option<String>,

    /// Register `ipn_url` with the gateway at startup when no `ipn_id` is set
    #[serde(default)]
    pub register_ipn_on_startup: bool,

    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            ipn_url: None,
            ipn_id: None,
            callback_url: None,
            register_ipn_on_startup: false,
            timeout_secs: default_gateway_timeout_secs(),
            currency: default_currency(),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Outbound order notification (mail relay) configuration
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    /// Relay endpoint receiving order events; logging only when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// HMAC secret used to sign relay payloads
    #[serde(default)]
    pub signing_secret: Option<String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl NotificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_NOTIFICATION_TIMEOUT_SECS))
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL, or `memory://` for the in-process store
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
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

    /// Whether to create the schema on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Storefront base URL that browser callbacks redirect back to
    #[validate(url)]
    pub app_url: String,

    /// Secret for verifying session credentials
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// `user_id` sentinel of orders placed without an account
    #[serde(default = "default_guest_user_id")]
    pub guest_user_id: String,

    /// Prefix of pre-registration anonymous user ids
    #[serde(default = "default_anonymous_user_prefix")]
    pub anonymous_user_prefix: String,

    /// Attempts at the versioned read-merge-write before giving up
    #[serde(default = "default_reconcile_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub reconcile_max_attempts: u32,

    /// Age after which an unfinished inventory claim is considered abandoned
    #[serde(default = "default_inventory_claim_ttl_secs")]
    pub inventory_claim_ttl_secs: u64,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default)]
    #[validate]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything not given
    pub fn new(
        database_url: String,
        app_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            app_url,
            jwt_secret,
            guest_user_id: default_guest_user_id(),
            anonymous_user_prefix: default_anonymous_user_prefix(),
            reconcile_max_attempts: default_reconcile_max_attempts(),
            inventory_claim_ttl_secs: default_inventory_claim_ttl_secs(),
            cors_allowed_origins: None,
            gateway: GatewayConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url == MEMORY_DATABASE_URL
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn inventory_claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inventory_claim_ttl_secs as i64)
    }

    /// Storefront dashboard URL without a trailing slash
    pub fn dashboard_url(&self) -> String {
        format!("{}/dashboard", self.app_url.trim_end_matches('/'))
    }

    /// Cross-field checks that `validator` derives cannot express
    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.is_production() && self.uses_memory_store() {
            let mut err = ValidationError::new("database_url");
            err.message = Some("the in-memory order store is not allowed in production".into());
            errors.add("database_url", err);
        }

        if self.gateway.register_ipn_on_startup && self.gateway.ipn_url.is_none() {
            let mut err = ValidationError::new("gateway");
            err.message = Some("register_ipn_on_startup requires gateway.ipn_url".into());
            errors.add("gateway", err);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_guest_user_id() -> String {
    crate::models::GUEST_USER_ID.to_string()
}

fn default_anonymous_user_prefix() -> String {
    "anon_".to_string()
}

fn default_reconcile_max_attempts() -> u32 {
    DEFAULT_RECONCILE_ATTEMPTS
}

fn default_inventory_claim_ttl_secs() -> u64 {
    DEFAULT_INVENTORY_CLAIM_TTL_SECS
}

fn default_gateway_base_url() -> String {
    "https://cybqa.pesapal.com/pesapalv3".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}

fn default_currency() -> String {
    "KES".to_string()
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("log_level");
            err.message = Some("log_level must be one of trace, debug, info, warn, error".into());
            Err(err)
        }
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_payments={},tower_http=debug", level);
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

    // jwt_secret has no default and must come from a file or APP__JWT_SECRET
    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("app_url", "http://localhost:3000")?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET (minimum 32 characters).");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
