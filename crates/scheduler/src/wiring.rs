//! Builds the production processor from configuration.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use digest_common::clock::SystemClock;
use digest_common::config::AppConfig;
use digest_common::error::DigestError;
use digest_engine::{ChangeDetector, DigestProcessor, PgStore};
use digest_fetcher::HttpFetcher;
use digest_notifier::{Dispatcher, LogMailer, Mailer, ResendMailer};

/// Resend when an API key is configured, otherwise log-only delivery.
pub fn build_mailer(config: &AppConfig) -> Result<Arc<dyn Mailer>, DigestError> {
    let timeout = Duration::from_millis(config.send_timeout_ms);

    match (&config.resend_api_key, &config.email_from) {
        (Some(key), Some(from)) => {
            tracing::info!(from = %from, "Email delivery via Resend");
            Ok(Arc::new(ResendMailer::new(key.clone(), from.clone(), timeout)?))
        }
        (Some(_), None) => Err(DigestError::Config(
            "EMAIL_FROM is required when RESEND_API_KEY is set".to_string(),
        )),
        (None, _) => {
            tracing::warn!("RESEND_API_KEY not set, digests will only be logged");
            Ok(Arc::new(LogMailer))
        }
    }
}

pub fn build_processor(config: &AppConfig, pool: PgPool) -> Result<DigestProcessor, DigestError> {
    let store = Arc::new(PgStore::new(pool));
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_millis(
        config.fetch_timeout_ms,
    ))?);
    let dispatcher = Dispatcher::new(
        build_mailer(config)?,
        Duration::from_millis(config.send_timeout_ms),
    );

    if !config.diff_identity_fields.is_empty() {
        tracing::info!(
            fields = ?config.diff_identity_fields,
            "Change detection limited to identity fields"
        );
    }

    Ok(
        DigestProcessor::new(store, fetcher, dispatcher, Arc::new(SystemClock))
            .with_change_detector(ChangeDetector::with_identity_fields(
                config.diff_identity_fields.clone(),
            )),
    )
}
