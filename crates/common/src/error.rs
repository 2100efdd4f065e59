use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Errors raised by a single query's digest cycle.
///
/// Every variant is local to one query: the scheduler logs it, records it on
/// the query and moves on.
#[derive(Debug, Error)]
pub enum DigestError {
    /// The resolved query URL is not allowed by the service's endpoint pattern.
    #[error("Endpoint violation: {url} does not match {pattern}")]
    EndpointViolation { url: String, pattern: String },

    /// Network or HTTP failure while fetching the source.
    #[error("Fetch error{}: {message}", status_suffix(.status))]
    Fetch {
        status: Option<u16>,
        message: String,
    },

    /// The response body does not have the expected shape.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A template references data the context does not provide.
    #[error("Render error: {0}")]
    Render(String),

    /// A single recipient could not be reached.
    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DigestError {
    /// Stable label for logs and the `last_error` column.
    pub fn kind(&self) -> &'static str {
        match self {
            DigestError::EndpointViolation { .. } => "endpoint_violation",
            DigestError::Fetch { .. } => "fetch_error",
            DigestError::Parse(_) => "parse_error",
            DigestError::Render(_) => "render_error",
            DigestError::Delivery(_) => "delivery_error",
            DigestError::Database(_) => "database_error",
            DigestError::Config(_) => "config_error",
        }
    }

    /// Whether the next scheduled tick may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DigestError::Fetch { .. } | DigestError::Parse(_) | DigestError::Database(_)
        )
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

/// Errors surfaced through the status API.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Digest error: {0}")]
    Digest(DigestError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DigestError> for AppError {
    fn from(err: DigestError) -> Self {
        match err {
            DigestError::Database(e) => AppError::Database(e),
            other => AppError::Digest(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Digest(DigestError::Render(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            AppError::Digest(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
