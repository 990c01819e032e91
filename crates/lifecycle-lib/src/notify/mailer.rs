//! Mail delivery

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::info;
use url::Url;

use super::{Notification, NotifyError};

/// Delivers rendered notifications
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    source: &'a str,
    to: &'a [String],
    subject: &'a str,
    html: &'a str,
}

/// Posts each notification as JSON to an HTTP mail relay
pub struct HttpMailer {
    client: Client,
    relay_url: Url,
    source: String,
}

impl HttpMailer {
    pub fn new(
        relay_url: &str,
        source: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            relay_url: Url::parse(relay_url)?,
            source: source.into(),
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = RelayMessage {
            source: &self.source,
            to: &notification.recipients,
            subject: &notification.subject,
            html: &notification.html_body,
        };

        let response = self
            .client
            .post(self.relay_url.clone())
            .json(&message)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Relay { status, body });
        }

        info!(
            tenant = %notification.tenant,
            kind = %notification.kind,
            recipients = ?notification.recipients,
            "Notification sent"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Logs notifications instead of sending them
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            tenant = %notification.tenant,
            kind = %notification.kind,
            recipients = ?notification.recipients,
            subject = %notification.subject,
            body_bytes = notification.html_body.len(),
            "Notification not sent, no mail relay configured"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
