use std::env;
use std::time::Duration;

use anyhow::Result;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("MYSQL_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("MYSQL_PORT")
                .unwrap_or_else(|_| "3306".to_string())
                .parse()?,
            username: env::var("MYSQL_USER").unwrap_or_else(|_| "root".to_string()),
            password: env::var("MYSQL_PASSWORD")?,
            database: env::var("MYSQL_DATABASE").unwrap_or_else(|_| "prism_gateway".to_string()),
        })
    }

    pub fn connection_string(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }

    /// Shared pool: 25 open / 5 idle / 5-minute connection lifetime.
    pub async fn connect(&self) -> Result<MySqlPool> {
        let pool = MySqlPoolOptions::new()
            .max_connections(25)
            .min_connections(5)
            .max_lifetime(Duration::from_secs(300))
            .connect(&self.connection_string())
            .await?;
        Ok(pool)
    }
}

/// Accounting engine tuning (USAGE_TRACKING_* options).
#[derive(Debug, Clone)]
pub struct UsageTrackingConfig {
    pub enabled: bool,
    pub channel_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub retention_days: i64,
    pub cleanup_hour: u32,
    pub cleanup_minute: u32,
}

impl UsageTrackingConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_bool("USAGE_TRACKING_ENABLED", true),
            channel_size: env_parse("USAGE_TRACKING_CHANNEL_SIZE", 1024),
            batch_size: env_parse("USAGE_TRACKING_BATCH_SIZE", 50),
            flush_interval: Duration::from_millis(env_parse(
                "USAGE_TRACKING_FLUSH_INTERVAL",
                2000u64,
            )),
            max_retries: env_parse("USAGE_TRACKING_MAX_RETRIES", 3),
            retry_backoff_ms: env_parse("USAGE_TRACKING_RETRY_BACKOFF_MS", 500),
            retention_days: env_parse("USAGE_TRACKING_RETENTION_DAYS", 30),
            cleanup_hour: env_parse("USAGE_TRACKING_CLEANUP_HOUR", 3),
            cleanup_minute: env_parse("USAGE_TRACKING_CLEANUP_MINUTE", 0),
        }
    }
}

/// Session daily-quota reset schedule (QUOTA_* options).
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub enabled: bool,
    pub reset_hour: u32,
}

impl QuotaConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_bool("QUOTA_ENABLED", true),
            reset_hour: env_parse("QUOTA_RESET_HOUR", 0),
        }
    }
}

/// Request-rate envelope (RATE_LIMIT_* options).
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst: u32,
}

impl RateLimitConfig {
    fn from_env() -> Self {
        Self {
            requests_per_second: env_parse("RATE_LIMIT_RPS", 20),
            burst: env_parse("RATE_LIMIT_BURST", 40),
        }
    }
}

/// Upstream driver credentials. A driver with no key is simply unavailable
/// in the provider registry.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
    /// Endpoint the session-backed driver talks to.
    pub session_base_url: Option<String>,
}

impl ProviderConfig {
    fn from_env() -> Self {
        Self {
            openai_api_key: env_nonempty("OPENAI_API_KEY"),
            openai_base_url: env_nonempty("OPENAI_BASE_URL"),
            anthropic_api_key: env_nonempty("ANTHROPIC_API_KEY"),
            anthropic_base_url: env_nonempty("ANTHROPIC_BASE_URL"),
            session_base_url: env_nonempty("SESSION_UPSTREAM_BASE_URL"),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub database_pool: MySqlPool,
    /// One-time seed of the admin token; ignored once the token exists.
    pub admin_key: Option<String>,
    /// Base64 AES-256 key for session credential columns.
    pub session_encryption_key: String,
    pub usage_tracking: UsageTrackingConfig,
    pub quota: QuotaConfig,
    pub rate_limit: RateLimitConfig,
    pub providers: ProviderConfig,
    pub cors_origins: Vec<String>,
    pub server_port: u16,
    pub debug: bool,
    /// Request-scoped deadline for a completion call.
    pub request_timeout: Duration,
}

impl AppConfig {
    pub async fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let database = DatabaseConfig::from_env()?;
        let database_pool = database.connect().await?;

        Ok(Self {
            database,
            database_pool,
            admin_key: env_nonempty("ADMIN_KEY"),
            session_encryption_key: env::var("SESSION_ENCRYPTION_KEY")?,
            usage_tracking: UsageTrackingConfig::from_env(),
            quota: QuotaConfig::from_env(),
            rate_limit: RateLimitConfig::from_env(),
            providers: ProviderConfig::from_env(),
            cors_origins,
            server_port: env_parse("SERVER_PORT", 8080),
            debug: env_bool("DEBUG", false),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 300u64)),
        })
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
