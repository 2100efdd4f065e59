use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::AppConfig;

/// Connect the PostgreSQL pool that holds services, queries and subscribers.
///
/// The pool is sized from `AppConfig::db_max_connections`; with concurrent
/// query cycles each holding a connection only while reading or writing, a
/// pool smaller than `max_concurrency` still works but serializes store calls.
pub async fn create_pool(config: &AppConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;

    tracing::info!(
        max_connections = config.db_max_connections,
        "Connected to PostgreSQL"
    );
    Ok(pool)
}
