//! HTTP webhook sender.

use async_trait::async_trait;
use serde::Serialize;
use shipwright_core::{NotifyErrorKind, NotifyResult, WebhookSender};
use std::time::Duration;
use tracing::debug;

use crate::{InfrastructureErrorKind, InfrastructureResult};

/// Body posted to a webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    /// Title and summary, separated by a newline
    pub text: String,
}

impl WebhookPayload {
    /// Builds the payload for a notification
    #[must_use]
    pub fn new(title: &str, text: &str) -> Self {
        Self {
            text: format!("{title}\n{text}"),
        }
    }
}

/// [`WebhookSender`] posting JSON with `reqwest`
#[derive(Debug, Clone)]
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    /// Creates a sender whose requests give up after `timeout`
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be initialised.
    pub fn new(timeout: Duration) -> InfrastructureResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|reason| InfrastructureErrorKind::HttpClient { reason })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, url: &str, title: &str, text: &str) -> NotifyResult {
        let response = self
            .client
            .post(url)
            .json(&WebhookPayload::new(title, text))
            .send()
            .await
            .map_err(|e| NotifyErrorKind::Webhook {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(NotifyErrorKind::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }
        debug!(%url, status = status.as_u16(), "webhook delivered");
        Ok(())
    }
}
