use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DigestError;
use crate::value::Value;

/// Outcome of the most recent cycle for a query, as stored in `queries.last_status`.
///
/// A failed fetch stores the error's [`DigestError::kind`] label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Delivered,
    PartiallyDelivered,
    Unchanged,
    RenderFailed,
    EndpointViolation,
    FetchError,
    ParseError,
    RenderError,
    DeliveryError,
    DatabaseError,
    ConfigError,
}

impl RunStatus {
    /// Status recorded for a cycle that stopped on `err`.
    pub fn from_error(err: &DigestError) -> Self {
        match err {
            DigestError::EndpointViolation { .. } => RunStatus::EndpointViolation,
            DigestError::Fetch { .. } => RunStatus::FetchError,
            DigestError::Parse(_) => RunStatus::ParseError,
            DigestError::Render(_) => RunStatus::RenderError,
            DigestError::Delivery(_) => RunStatus::DeliveryError,
            DigestError::Database(_) => RunStatus::DatabaseError,
            DigestError::Config(_) => RunStatus::ConfigError,
        }
    }

    /// Failures that the next tick cannot fix. A query in one of these
    /// states is left out of scheduling until its status is cleared or a
    /// manual run succeeds.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            RunStatus::EndpointViolation
                | RunStatus::RenderError
                | RunStatus::DeliveryError
                | RunStatus::ConfigError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Delivered => "delivered",
            RunStatus::PartiallyDelivered => "partially_delivered",
            RunStatus::Unchanged => "unchanged",
            RunStatus::RenderFailed => "render_failed",
            RunStatus::EndpointViolation => "endpoint_violation",
            RunStatus::FetchError => "fetch_error",
            RunStatus::ParseError => "parse_error",
            RunStatus::RenderError => "render_error",
            RunStatus::DeliveryError => "delivery_error",
            RunStatus::DatabaseError => "database_error",
            RunStatus::ConfigError => "config_error",
        }
    }

    /// Blocking statuses, as stored text.
    pub fn blocking() -> impl Iterator<Item = RunStatus> {
        [
            RunStatus::EndpointViolation,
            RunStatus::RenderError,
            RunStatus::DeliveryError,
            RunStatus::ConfigError,
        ]
        .into_iter()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-recipient delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
    /// Not attempted because the address already received this digest.
    Skipped,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A source integration: an allow-listed endpoint plus digest templates.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub slug: String,
    /// Allow-list pattern every resolved query URL must fully match.
    pub endpoint: String,
    pub subject_template: String,
    pub body_template: String,
}

/// A recurring, parameterized request against a service.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Query {
    pub id: i64,
    pub service_id: i64,
    /// URL template; may contain `formatDate` expressions resolved per run.
    pub url: String,
    /// Last stored result set, as JSON.
    pub snapshot: Option<serde_json::Value>,
    /// Bumped on every snapshot write; used for compare-and-set.
    pub snapshot_version: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub last_error: Option<String>,
}

impl Query {
    /// True when the last run hit a failure that retrying cannot fix.
    pub fn is_blocked(&self) -> bool {
        self.last_status.is_some_and(RunStatus::is_blocking)
    }

    /// Decode the stored snapshot, if any.
    pub fn result_snapshot(&self) -> Result<Option<ResultSet>, DigestError> {
        self.snapshot
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| DigestError::Parse(format!("stored snapshot is malformed: {}", e)))
    }
}

/// An email recipient attached to exactly one query.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscriber {
    pub id: i64,
    pub query_id: i64,
    pub email: String,
}

/// A query together with its owning service: the unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryJob {
    pub service: Service,
    pub query: Query,
}

/// One record of a result set. Sorted keys make field order irrelevant.
pub type Record = BTreeMap<String, Value>;

/// A named, ordered sequence of records returned by a query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub name: String,
    pub records: Vec<Record>,
}

impl ResultSet {
    pub fn new(name: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The `data` value exposed to digest templates:
    /// `{ <name>: [records...], total_rows: n }`.
    pub fn to_value(&self) -> Value {
        let rows = Value::Sequence(
            self.records
                .iter()
                .map(|r| Value::Mapping(r.clone()))
                .collect(),
        );
        Value::mapping([
            (self.name.clone(), rows),
            ("total_rows".to_string(), Value::from(self.records.len())),
        ])
    }
}

/// A rendered notification, ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub subject: String,
    pub body: String,
}

/// Delivery outcome for a single subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub subscriber_id: i64,
    pub email: String,
    pub status: DeliveryStatus,
    pub error_detail: Option<String>,
}

/// Per-subscriber outcomes of one dispatch, in subscriber order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub entries: Vec<DeliveryRecord>,
}

impl DeliveryReport {
    pub fn sent_count(&self) -> usize {
        self.count(DeliveryStatus::Sent)
    }

    pub fn failed_count(&self) -> usize {
        self.count(DeliveryStatus::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(DeliveryStatus::Skipped)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The run status this report implies.
    pub fn run_status(&self) -> RunStatus {
        if self.failed_count() > 0 {
            RunStatus::PartiallyDelivered
        } else {
            RunStatus::Delivered
        }
    }

    fn count(&self, status: DeliveryStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }
}
