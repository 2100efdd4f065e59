//! Persistence for the digest cycle.
//!
//! The cycle only ever reads services, queries and subscribers; it writes
//! the query's run columns (`snapshot`, `snapshot_version`, `last_*`) and
//! appends to `deliveries`. [`PgStore`] is the PostgreSQL implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use digest_common::error::DigestError;
use digest_common::types::{
    DeliveryReport, Query, QueryJob, ResultSet, RunStatus, Service, Subscriber,
};

#[async_trait]
pub trait DigestStore: Send + Sync {
    /// Queries that have at least one subscriber, with their service.
    /// Queries blocked by a non-retryable failure are left out.
    async fn active_queries(&self) -> Result<Vec<QueryJob>, DigestError>;

    async fn load_query(&self, query_id: i64) -> Result<Option<QueryJob>, DigestError>;

    /// Subscribers of a query, in id order. Empty when the query is gone.
    async fn subscribers(&self, query_id: i64) -> Result<Vec<Subscriber>, DigestError>;

    /// Store `snapshot` and the run outcome if the stored version still equals
    /// `expected_version`. Returns false when another writer got there first.
    async fn record_snapshot(
        &self,
        query_id: i64,
        expected_version: i64,
        snapshot: &ResultSet,
        status: RunStatus,
        error: Option<&str>,
        ran_at: DateTime<Utc>,
    ) -> Result<bool, DigestError>;

    /// Record a failed run under the error's kind. The snapshot is left
    /// untouched.
    async fn record_failure(
        &self,
        query_id: i64,
        error: &DigestError,
        ran_at: DateTime<Utc>,
    ) -> Result<(), DigestError>;

    async fn log_deliveries(
        &self,
        query_id: i64,
        run_id: Uuid,
        report: &DeliveryReport,
        at: DateTime<Utc>,
    ) -> Result<(), DigestError>;
}

/// Row shape of the query/service join.
#[derive(sqlx::FromRow)]
struct JobRow {
    query_id: i64,
    service_id: i64,
    url: String,
    snapshot: Option<serde_json::Value>,
    snapshot_version: i64,
    last_run_at: Option<DateTime<Utc>>,
    last_status: Option<RunStatus>,
    last_error: Option<String>,
    service_name: String,
    service_slug: String,
    endpoint: String,
    subject_template: String,
    body_template: String,
}

impl From<JobRow> for QueryJob {
    fn from(row: JobRow) -> Self {
        QueryJob {
            service: Service {
                id: row.service_id,
                name: row.service_name,
                slug: row.service_slug,
                endpoint: row.endpoint,
                subject_template: row.subject_template,
                body_template: row.body_template,
            },
            query: Query {
                id: row.query_id,
                service_id: row.service_id,
                url: row.url,
                snapshot: row.snapshot,
                snapshot_version: row.snapshot_version,
                last_run_at: row.last_run_at,
                last_status: row.last_status,
                last_error: row.last_error,
            },
        }
    }
}

const JOB_COLUMNS: &str = r#"
    q.id AS query_id, q.service_id, q.url, q.snapshot, q.snapshot_version,
    q.last_run_at, q.last_status, q.last_error,
    s.name AS service_name, s.slug AS service_slug, s.endpoint,
    s.subject_template, s.body_template
"#;

/// [`DigestStore`] over a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DigestStore for PgStore {
    async fn active_queries(&self) -> Result<Vec<QueryJob>, DigestError> {
        let blocking: Vec<String> = RunStatus::blocking().map(|s| s.to_string()).collect();

        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM queries q
            JOIN services s ON s.id = q.service_id
            WHERE EXISTS (SELECT 1 FROM subscribers sub WHERE sub.query_id = q.id)
              AND (q.last_status IS NULL OR q.last_status <> ALL($1))
            ORDER BY q.id
            "#
        ))
        .bind(blocking)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(QueryJob::from).collect())
    }

    async fn load_query(&self, query_id: i64) -> Result<Option<QueryJob>, DigestError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM queries q
            JOIN services s ON s.id = q.service_id
            WHERE q.id = $1
            "#
        ))
        .bind(query_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(QueryJob::from))
    }

    async fn subscribers(&self, query_id: i64) -> Result<Vec<Subscriber>, DigestError> {
        let subscribers: Vec<Subscriber> = sqlx::query_as(
            r#"
            SELECT sub.id, sub.query_id, sub.email
            FROM subscribers sub
            JOIN queries q ON q.id = sub.query_id
            WHERE sub.query_id = $1
            ORDER BY sub.id
            "#,
        )
        .bind(query_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscribers)
    }

    async fn record_snapshot(
        &self,
        query_id: i64,
        expected_version: i64,
        snapshot: &ResultSet,
        status: RunStatus,
        error: Option<&str>,
        ran_at: DateTime<Utc>,
    ) -> Result<bool, DigestError> {
        let snapshot = serde_json::to_value(snapshot)
            .map_err(|e| DigestError::Parse(format!("snapshot not serializable: {}", e)))?;

        let result = sqlx::query(
            r#"
            UPDATE queries
            SET snapshot = $3,
                snapshot_version = snapshot_version + 1,
                last_run_at = $4,
                last_status = $5,
                last_error = $6
            WHERE id = $1 AND snapshot_version = $2
            "#,
        )
        .bind(query_id)
        .bind(expected_version)
        .bind(snapshot)
        .bind(ran_at)
        .bind(status.to_string())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(
        &self,
        query_id: i64,
        error: &DigestError,
        ran_at: DateTime<Utc>,
    ) -> Result<(), DigestError> {
        sqlx::query(
            r#"
            UPDATE queries
            SET last_run_at = $2, last_status = $3, last_error = $4
            WHERE id = $1
            "#,
        )
        .bind(query_id)
        .bind(ran_at)
        .bind(RunStatus::from_error(error).as_str())
        .bind(error.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn log_deliveries(
        &self,
        query_id: i64,
        run_id: Uuid,
        report: &DeliveryReport,
        at: DateTime<Utc>,
    ) -> Result<(), DigestError> {
        let mut tx = self.pool.begin().await?;

        for entry in &report.entries {
            sqlx::query(
                r#"
                INSERT INTO deliveries
                    (id, run_id, query_id, subscriber_id, email, status, error_detail, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(query_id)
            .bind(entry.subscriber_id)
            .bind(&entry.email)
            .bind(entry.status.to_string())
            .bind(entry.error_detail.as_deref())
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
