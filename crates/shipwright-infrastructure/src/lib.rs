//! # Shipwright Infrastructure
//!
//! Adapters for the collaborators the worker talks to but does not own.
//!
//! ## Architecture
//!
//! - `postgres`: [`JobRepository`](shipwright_core::JobRepository) over a
//!   PostgreSQL pool
//! - `smtp`: [`MailSender`](shipwright_core::MailSender) over SMTP
//! - `webhook`: [`WebhookSender`](shipwright_core::WebhookSender) posting JSON
//!   over HTTP
//!
//! ## Example
//!
//! ```rust,ignore
//! use shipwright_infrastructure::{HttpWebhookSender, PgJobRepository, SmtpMailer, SmtpSettings};
//!
//! let repo = PgJobRepository::connect("postgres://localhost/shipwright").await?;
//! let mailer = SmtpMailer::new(&SmtpSettings::default())?;
//! let webhooks = HttpWebhookSender::new(std::time::Duration::from_secs(10))?;
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod postgres;
pub mod smtp;
pub mod webhook;

pub use postgres::PgJobRepository;
pub use smtp::{SmtpMailer, SmtpSettings};
pub use webhook::HttpWebhookSender;

/// Infrastructure error
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct InfrastructureError(#[from] InfrastructureErrorKind);

/// Specific infrastructure error kinds
#[derive(Debug, thiserror::Error)]
pub enum InfrastructureErrorKind {
    #[error("database connection failed: {reason}")]
    Database { reason: sqlx::Error },

    #[error("invalid sender address {address}: {reason}")]
    Sender { address: String, reason: String },

    #[error("cannot build HTTP client: {reason}")]
    HttpClient { reason: reqwest::Error },
}

/// Infrastructure result type
pub type InfrastructureResult<T = ()> = Result<T, InfrastructureError>;
