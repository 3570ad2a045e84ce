//! SMTP mail sender.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use shipwright_core::{MailSender, NotifyErrorKind, NotifyResult};
use tracing::debug;

use crate::{InfrastructureErrorKind, InfrastructureResult};

/// SMTP relay settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpSettings {
    /// Relay host
    pub host: String,
    /// Relay port
    pub port: u16,
    /// `From` address
    pub sender: String,
    /// Login, when the relay requires authentication
    pub username: Option<String>,
    /// Password for `username`
    pub password: Option<String>,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1025,
            sender: "noreply@shipwright.local".to_string(),
            username: None,
            password: None,
        }
    }
}

/// [`MailSender`] delivering HTML mail through an SMTP relay
///
/// The connection is unencrypted, as expected by local relays.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("sender", &self.sender.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpMailer {
    /// Creates a mailer for the relay in `settings`
    ///
    /// # Errors
    ///
    /// Returns an error when the sender address is invalid.
    pub fn new(settings: &SmtpSettings) -> InfrastructureResult<Self> {
        let sender = settings
            .sender
            .parse::<Mailbox>()
            .map_err(|e| InfrastructureErrorKind::Sender {
                address: settings.sender.clone(),
                reason: e.to_string(),
            })?;

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host).port(settings.port);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            sender,
        })
    }

    fn message(&self, to: &str, subject: &str, html: &str) -> NotifyResult<Message> {
        let recipient = to.parse::<Mailbox>().map_err(|e| NotifyErrorKind::Address {
            address: to.to_string(),
            reason: e.to_string(),
        })?;
        let message = Message::builder()
            .from(self.sender.clone())
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| NotifyErrorKind::Mail {
                reason: e.to_string(),
            })?;
        Ok(message)
    }
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> NotifyResult {
        let message = self.message(to, subject, html)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| NotifyErrorKind::Mail {
                reason: e.to_string(),
            })?;
        debug!(%to, %subject, "mail delivered to relay");
        Ok(())
    }
}
