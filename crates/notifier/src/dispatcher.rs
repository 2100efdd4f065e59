//! Fan-out of one digest to a query's subscribers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use validator::ValidateEmail;

use digest_common::types::{DeliveryRecord, DeliveryReport, DeliveryStatus, Digest, Subscriber};

use crate::mailer::Mailer;

/// Delivers digests, one attempt per recipient.
///
/// A recipient's failure is recorded and the loop moves on. Nothing is
/// retried here: a retry would risk a second copy for recipients whose
/// first send actually went through.
#[derive(Clone)]
pub struct Dispatcher {
    mailer: Arc<dyn Mailer>,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(mailer: Arc<dyn Mailer>, send_timeout: Duration) -> Self {
        Self {
            mailer,
            send_timeout,
        }
    }

    /// Send `digest` to each subscriber, in order.
    ///
    /// The report has exactly one entry per subscriber passed in. Invalid
    /// addresses fail without a send; repeated addresses (compared
    /// case-insensitively) are skipped.
    pub async fn dispatch(&self, digest: &Digest, subscribers: &[Subscriber]) -> DeliveryReport {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(subscribers.len());

        for subscriber in subscribers {
            let email = subscriber.email.trim().to_string();

            let (status, error_detail) = if !email.validate_email() {
                (
                    DeliveryStatus::Failed,
                    Some("invalid email address".to_string()),
                )
            } else if !seen.insert(email.to_lowercase()) {
                (
                    DeliveryStatus::Skipped,
                    Some("duplicate address for this query".to_string()),
                )
            } else {
                self.send_one(subscriber, &email, digest).await
            };

            entries.push(DeliveryRecord {
                subscriber_id: subscriber.id,
                email,
                status,
                error_detail,
            });
        }

        let report = DeliveryReport { entries };
        tracing::info!(
            recipients = report.len(),
            sent = report.sent_count(),
            failed = report.failed_count(),
            skipped = report.skipped_count(),
            "Digest dispatched"
        );
        report
    }

    async fn send_one(
        &self,
        subscriber: &Subscriber,
        email: &str,
        digest: &Digest,
    ) -> (DeliveryStatus, Option<String>) {
        let send = self.mailer.send(email, &digest.subject, &digest.body);

        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(Ok(())) => {
                tracing::debug!(subscriber_id = subscriber.id, "Digest sent");
                (DeliveryStatus::Sent, None)
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    subscriber_id = subscriber.id,
                    error = %e,
                    "Digest delivery failed"
                );
                (DeliveryStatus::Failed, Some(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    subscriber_id = subscriber.id,
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "Digest delivery timed out"
                );
                (
                    DeliveryStatus::Failed,
                    Some(format!(
                        "send timed out after {}ms",
                        self.send_timeout.as_millis()
                    )),
                )
            }
        }
    }
}
