//! Source fetcher: resolves a query's URL, enforces the service's endpoint
//! allow-list, performs the HTTP GET and parses the body into a result set.
//!
//! The fetcher never touches stored state. It is reachable through the
//! [`ResultSource`] trait so the cycle processor can be driven by fakes.

pub mod endpoint;
pub mod parse;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;

use digest_common::error::DigestError;
use digest_common::types::{Query, ResultSet, Service};
use digest_common::value::Value;
use digest_template::{Escape, Renderer};

/// Longest slice of an error response body kept in the error message.
const ERROR_BODY_SNIPPET: usize = 200;

/// Anything that can produce the current result set for a query.
#[async_trait]
pub trait ResultSource: Send + Sync {
    async fn fetch(
        &self,
        service: &Service,
        query: &Query,
        now: DateTime<Utc>,
    ) -> Result<ResultSet, DigestError>;
}

/// Resolve the query's URL template against `now`.
///
/// The template can reference `query.id` and the service's `id`, `name` and
/// `slug` besides the `formatDate` helper.
pub fn resolve_url(
    service: &Service,
    query: &Query,
    now: DateTime<Utc>,
) -> Result<String, DigestError> {
    let context = Value::mapping([
        (
            "query",
            Value::mapping([
                ("id", Value::from(query.id)),
                ("service_id", Value::from(query.service_id)),
            ]),
        ),
        (
            "service",
            Value::mapping([
                ("id", Value::from(service.id)),
                ("name", Value::from(service.name.as_str())),
                ("slug", Value::from(service.slug.as_str())),
            ]),
        ),
    ]);

    let url = Renderer::at(now)
        .with_escape(Escape::None)
        .render(&query.url, &context)?;
    Ok(url.trim().to_string())
}

/// HTTP-backed [`ResultSource`].
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, DigestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("digest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DigestError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResultSource for HttpFetcher {
    async fn fetch(
        &self,
        service: &Service,
        query: &Query,
        now: DateTime<Utc>,
    ) -> Result<ResultSet, DigestError> {
        let url = resolve_url(service, query, now)?;

        // Validate before any network activity.
        endpoint::check(&service.endpoint, &url)?;

        tracing::debug!(query_id = query.id, url = %url, "Fetching query source");

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(ERROR_BODY_SNIPPET).collect();
            return Err(DigestError::Fetch {
                status: Some(status.as_u16()),
                message: if snippet.is_empty() {
                    status.canonical_reason().unwrap_or("error").to_string()
                } else {
                    snippet
                },
            });
        }

        let body = response.bytes().await.map_err(transport_error)?;
        let result_set = parse::parse_body(&body)?;

        tracing::debug!(
            query_id = query.id,
            records = result_set.len(),
            bytes = body.len(),
            "Fetched query source"
        );

        Ok(result_set)
    }
}

fn transport_error(err: reqwest::Error) -> DigestError {
    let message = if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    };
    DigestError::Fetch {
        status: err.status().map(|s| s.as_u16()),
        message,
    }
}
