//! Read-only status API over the digest store.
//!
//! Endpoints:
//! - GET /health
//! - GET /api/queries/{id}: last run status and snapshot size
//! - GET /api/queries/{id}/preview: digest rendered from the stored snapshot

pub mod routes;
pub mod state;
