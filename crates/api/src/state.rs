//! Shared application state for the Axum API server.

use std::sync::Arc;

use digest_common::clock::Clock;
use digest_engine::DigestStore;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DigestStore>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(store: Arc<dyn DigestStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}
