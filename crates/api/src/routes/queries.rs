//! Query status and digest preview routes.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use digest_common::error::{AppError, DigestError};
use digest_common::types::{QueryJob, RunStatus};
use digest_engine::build_digest;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/queries/{id}", get(query_status))
        .route("/api/queries/{id}/preview", get(preview_digest))
}

#[derive(Debug, Serialize)]
pub struct QueryStatus {
    pub id: i64,
    pub service: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub last_error: Option<String>,
    pub snapshot_version: i64,
    /// Record count of the stored snapshot; `None` before the first run.
    pub snapshot_records: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DigestPreview {
    pub query_id: i64,
    pub subject: String,
    pub body: String,
    pub records: usize,
    pub rendered_at: DateTime<Utc>,
}

async fn load(state: &AppState, id: i64) -> Result<QueryJob, AppError> {
    state
        .store
        .load_query(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("query {} not found", id)))
}

/// GET /api/queries/{id}: last run outcome for a query.
async fn query_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<QueryStatus>, AppError> {
    let QueryJob { service, query } = load(&state, id).await?;
    let snapshot = query
        .result_snapshot()
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(QueryStatus {
        id: query.id,
        service: service.slug,
        last_run_at: query.last_run_at,
        last_status: query.last_status,
        last_error: query.last_error,
        snapshot_version: query.snapshot_version,
        snapshot_records: snapshot.map(|s| s.len()),
    }))
}

/// GET /api/queries/{id}/preview: render the digest from the stored
/// snapshot. Nothing is fetched or sent.
async fn preview_digest(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DigestPreview>, AppError> {
    let QueryJob { service, query } = load(&state, id).await?;
    let snapshot = query
        .result_snapshot()
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("query {} has not run yet", id)))?;

    let now = state.clock.now();
    let digest = build_digest(&service, &query, &snapshot, now).map_err(DigestError::from)?;

    tracing::debug!(query_id = id, records = snapshot.len(), "Digest preview rendered");

    Ok(Json(DigestPreview {
        query_id: id,
        subject: digest.subject,
        body: digest.body,
        records: snapshot.len(),
        rendered_at: now,
    }))
}
