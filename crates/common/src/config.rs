use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Interval between scheduler ticks in seconds (default: 900)
    pub tick_interval_secs: u64,

    /// Maximum number of query cycles running at once (default: 8)
    pub max_concurrency: usize,

    /// Timeout for fetching a query's source, in milliseconds (default: 10000)
    pub fetch_timeout_ms: u64,

    /// Timeout for a single outbound email, in milliseconds (default: 10000)
    pub send_timeout_ms: u64,

    /// Resend API key for email delivery. When unset, digests are only logged.
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Record fields compared by the change detector. Empty means all fields.
    pub diff_identity_fields: Vec<String>,

    /// Port the status API listens on (default: 3000)
    pub api_port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", "20")?,
            tick_interval_secs: parse_env("SCHEDULER_TICK_INTERVAL_SECS", "900")?,
            max_concurrency: parse_env("SCHEDULER_MAX_CONCURRENCY", "8")?,
            fetch_timeout_ms: parse_env("FETCH_TIMEOUT_MS", "10000")?,
            send_timeout_ms: parse_env("SEND_TIMEOUT_MS", "10000")?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            diff_identity_fields: parse_list(
                &std::env::var("DIFF_IDENTITY_FIELDS").unwrap_or_default(),
            ),
            api_port: parse_env("API_PORT", "3000")?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_secs == 0 {
            anyhow::bail!("SCHEDULER_TICK_INTERVAL_SECS must be greater than 0");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            )
        })
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
