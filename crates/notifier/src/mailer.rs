use async_trait::async_trait;

use digest_common::error::DigestError;

/// An outbound email capability.
///
/// Implementations deliver at-least-once on their side; callers never retry
/// a send that returned, successfully or not.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, html_body: &str)
    -> Result<(), DigestError>;
}

/// Logs digests instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<(), DigestError> {
        tracing::info!(
            recipient,
            subject,
            body_bytes = html_body.len(),
            "Email delivery disabled, digest logged instead"
        );
        Ok(())
    }
}
