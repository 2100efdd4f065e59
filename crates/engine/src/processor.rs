//! Digest cycle pipeline.
//!
//! One cycle for one query:
//! 1. Fetch the current result set (via `ResultSource`)
//! 2. Diff it against the stored snapshot (via `ChangeDetector`)
//! 3. Render subject and body
//! 4. Dispatch to subscribers and log the deliveries
//! 5. Store the new snapshot
//!
//! The snapshot is written last so a cycle interrupted before dispatch
//! re-runs in full on the next tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use digest_common::clock::Clock;
use digest_common::error::DigestError;
use digest_common::types::{
    DeliveryReport, Digest, Query, QueryJob, ResultSet, RunStatus, Service,
};
use digest_common::value::Value;
use digest_fetcher::ResultSource;
use digest_notifier::Dispatcher;
use digest_template::{Escape, RenderError, Renderer};

use crate::differ::ChangeDetector;
use crate::store::DigestStore;

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Fetch failed and the snapshot is untouched. Retryable kinds run again
    /// next tick; the others block the query.
    Failed { kind: &'static str, message: String },
    Unchanged,
    /// The digest could not be rendered and was dropped.
    RenderFailed(String),
    Delivered(DeliveryReport),
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Failed { .. } => "failed",
            CycleOutcome::Unchanged => "unchanged",
            CycleOutcome::RenderFailed(_) => "render_failed",
            CycleOutcome::Delivered(_) => "delivered",
        }
    }
}

/// The template context for a digest:
/// `{ data: { <name>: [...], total_rows }, query: {...}, service: {...} }`.
pub fn digest_context(service: &Service, query: &Query, result_set: &ResultSet) -> Value {
    Value::mapping([
        ("data", result_set.to_value()),
        (
            "query",
            Value::mapping([
                ("id", Value::from(query.id)),
                ("service_id", Value::from(query.service_id)),
                ("url", Value::from(query.url.as_str())),
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
    ])
}

/// Render a digest. Pure for fixed inputs and `now`.
///
/// The subject is rendered without escaping, the body with HTML escaping.
pub fn build_digest(
    service: &Service,
    query: &Query,
    result_set: &ResultSet,
    now: DateTime<Utc>,
) -> Result<Digest, RenderError> {
    let context = digest_context(service, query, result_set);

    let subject = Renderer::at(now)
        .with_escape(Escape::None)
        .render(&service.subject_template, &context)?;
    let body = Renderer::at(now).render(&service.body_template, &context)?;

    Ok(Digest {
        subject: subject.trim().to_string(),
        body,
    })
}

/// Runs digest cycles against injected collaborators.
pub struct DigestProcessor {
    store: Arc<dyn DigestStore>,
    source: Arc<dyn ResultSource>,
    dispatcher: Dispatcher,
    detector: ChangeDetector,
    clock: Arc<dyn Clock>,
}

impl DigestProcessor {
    pub fn new(
        store: Arc<dyn DigestStore>,
        source: Arc<dyn ResultSource>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            source,
            dispatcher,
            detector: ChangeDetector::new(),
            clock,
        }
    }

    pub fn with_change_detector(mut self, detector: ChangeDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn store(&self) -> &Arc<dyn DigestStore> {
        &self.store
    }

    /// Run one full cycle for `job`.
    ///
    /// Fetch, diff and render failures are outcomes, not errors. `Err` means
    /// the store could not be read or written; the caller logs it and the
    /// query is retried on the next tick.
    pub async fn run_query(&self, job: &QueryJob) -> Result<CycleOutcome, DigestError> {
        let QueryJob { service, query } = job;
        let now = self.clock.now();

        let previous = match query.result_snapshot() {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(
                    query_id = query.id,
                    error = %e,
                    "Stored snapshot unreadable, treating run as first"
                );
                None
            }
        };

        // 1. Fetch
        let current = match self.source.fetch(service, query, now).await {
            Ok(rs) => rs,
            Err(err) => {
                log_fetch_failure(service, query, &err);
                self.store.record_failure(query.id, &err, now).await?;
                if !err.is_retryable() {
                    tracing::warn!(
                        query_id = query.id,
                        kind = err.kind(),
                        "Query blocked until it is edited or run manually"
                    );
                }
                return Ok(CycleOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                });
            }
        };

        // 2. Diff
        let summary = self.detector.summarize(previous.as_ref(), &current);
        if !summary.is_significant() {
            tracing::debug!(query_id = query.id, records = current.len(), "No change");
            self.store_snapshot(query, &current, RunStatus::Unchanged, None, now)
                .await?;
            return Ok(CycleOutcome::Unchanged);
        }

        tracing::info!(
            query_id = query.id,
            first_run = summary.first_run,
            added = summary.added,
            removed = summary.removed,
            changed = summary.changed,
            "Result set changed"
        );

        // 3. Render
        let digest = match build_digest(service, query, &current, now) {
            Ok(digest) => digest,
            Err(e) => {
                tracing::error!(
                    query_id = query.id,
                    service = %service.slug,
                    error = %e,
                    "Digest render failed, digest dropped"
                );
                let message = e.to_string();
                self.store_snapshot(
                    query,
                    &current,
                    RunStatus::RenderFailed,
                    Some(message.as_str()),
                    now,
                )
                .await?;
                return Ok(CycleOutcome::RenderFailed(message));
            }
        };

        // 4. Dispatch
        let subscribers = self.store.subscribers(query.id).await?;
        let report = self.dispatcher.dispatch(&digest, &subscribers).await;

        let run_id = Uuid::new_v4();
        if let Err(e) = self.store.log_deliveries(query.id, run_id, &report, now).await {
            // Sends already happened; keep going so the snapshot still advances.
            tracing::error!(
                query_id = query.id,
                run_id = %run_id,
                error = %e,
                "Failed to persist delivery log"
            );
        }

        // 5. Snapshot last
        let status = report.run_status();
        let error = (report.failed_count() > 0).then(|| {
            format!(
                "{} of {} deliveries failed",
                report.failed_count(),
                report.len()
            )
        });
        self.store_snapshot(query, &current, status, error.as_deref(), now)
            .await?;

        tracing::info!(
            query_id = query.id,
            run_id = %run_id,
            status = %status,
            sent = report.sent_count(),
            failed = report.failed_count(),
            "Digest cycle complete"
        );

        Ok(CycleOutcome::Delivered(report))
    }

    /// Load `query_id` and run a cycle. `None` when the query does not exist.
    pub async fn run_query_id(&self, query_id: i64) -> Result<Option<CycleOutcome>, DigestError> {
        match self.store.load_query(query_id).await? {
            Some(job) => self.run_query(&job).await.map(Some),
            None => Ok(None),
        }
    }

    async fn store_snapshot(
        &self,
        query: &Query,
        snapshot: &ResultSet,
        status: RunStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DigestError> {
        let stored = self
            .store
            .record_snapshot(query.id, query.snapshot_version, snapshot, status, error, now)
            .await?;

        if !stored {
            tracing::warn!(
                query_id = query.id,
                expected_version = query.snapshot_version,
                "Snapshot was updated concurrently, keeping the newer one"
            );
        }
        Ok(())
    }
}

fn log_fetch_failure(service: &Service, query: &Query, err: &DigestError) {
    match err {
        DigestError::EndpointViolation { url, pattern } => {
            tracing::error!(
                alert = true,
                query_id = query.id,
                service = %service.slug,
                url = %url,
                pattern = %pattern,
                "Query URL outside service endpoint, request blocked"
            );
        }
        DigestError::Parse(message) => {
            tracing::warn!(
                query_id = query.id,
                service = %service.slug,
                error = %message,
                "Source response could not be parsed"
            );
        }
        DigestError::Render(message) => {
            tracing::error!(
                query_id = query.id,
                service = %service.slug,
                error = %message,
                "Query URL template failed to resolve"
            );
        }
        other => {
            tracing::warn!(
                query_id = query.id,
                service = %service.slug,
                error = %other,
                "Source fetch failed"
            );
        }
    }
}
