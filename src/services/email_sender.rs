//! Outgoing email for owner reports
//!
//! `ResendEmailSender` posts to the Resend API, `LogEmailSender` only writes
//! the message to the log (no API key configured). Tests use
//! `FakeEmailSender`. Callers hold an `Arc<dyn EmailSender>`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// A rendered message ready to send
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, msg: EmailMessage) -> Result<()>;

    fn name(&self) -> &'static str;
}

// =============================================================================
// Log only
// =============================================================================

pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, msg: EmailMessage) -> Result<()> {
        info!(
            to = %msg.to,
            subject = %msg.subject,
            "Email not sent, no provider configured\n{}",
            msg.text,
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

// =============================================================================
// Resend
// =============================================================================

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ResendReceipt {
    id: String,
}

pub struct ResendEmailSender {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl ResendEmailSender {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            client,
            api_url: RESEND_API_URL.to_string(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl EmailSender for ResendEmailSender {
    async fn send(&self, msg: EmailMessage) -> Result<()> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&ResendRequest {
                from: &self.from,
                to: &msg.to,
                subject: &msg.subject,
                html: &msg.html,
                text: &msg.text,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Resend API error {}: {}", status, body));
        }

        let receipt: ResendReceipt = response.json().await?;
        info!(to = %msg.to, subject = %msg.subject, "Email sent via Resend, id {}", receipt.id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "resend"
    }
}

// =============================================================================
// Fake (tests)
// =============================================================================

#[cfg(test)]
pub use fake::FakeEmailSender;
