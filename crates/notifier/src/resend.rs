//! Email delivery through the Resend HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use digest_common::error::DigestError;

use crate::mailer::Mailer;

const DEFAULT_BASE_URL: &str = "https://api.resend.com";

#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// [`Mailer`] backed by Resend.
#[derive(Clone)]
pub struct ResendMailer {
    client: reqwest::Client,
    api_key: String,
    from: String,
    base_url: String,
}

impl ResendMailer {
    pub fn new(api_key: String, from: String, timeout: Duration) -> Result<Self, DigestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DigestError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            from,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point the mailer at a different API host (self-hosted relay, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<(), DigestError> {
        let request = SendEmailRequest {
            from: &self.from,
            to: [recipient],
            subject,
            html: html_body,
        };

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DigestError::Delivery("mail API request timed out".to_string())
                } else {
                    DigestError::Delivery(format!("mail API unreachable: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());

        Err(DigestError::Delivery(format!(
            "mail API returned {}: {}",
            status.as_u16(),
            detail
        )))
    }
}
