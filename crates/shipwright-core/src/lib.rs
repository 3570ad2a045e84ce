//! # Shipwright Core
//!
//! Core domain types for the Shipwright deployment worker.
//!
//! ## Architecture
//!
//! - `job`: Job records, job types and the status lifecycle
//! - `project`: Projects, inventories, applications and key material
//! - `notification`: Notification settings, recipient resolution and the
//!   mail/webhook delivery contracts
//! - `message`: JSON messages carried by the broker
//! - `repository`: The job repository contract and an in-memory implementation
//!
//! ## Example
//!
//! ```rust
//! use shipwright_core::{Job, JobStatus, JobType};
//!
//! let mut job = Job::new(42, JobType::Job);
//! assert!(job.transition(JobStatus::Processing, chrono::Utc::now()));
//! assert!(job.transition(JobStatus::Completed, chrono::Utc::now()));
//! assert!(!job.transition(JobStatus::Failed, chrono::Utc::now()));
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod job;
pub mod message;
pub mod notification;
pub mod project;
pub mod repository;

pub use job::{Job, JobLog, JobStatus, JobType};
pub use message::{JOB_QUEUE, JobMessage, STATUS_EXCHANGE, StatusMessage, log_exchange};
pub use notification::{
    ChannelTarget, MailSender, NotificationScope, NotificationType, Recipients,
    RelatedNotification, WebhookSender,
};
pub use project::{Application, Inventory, Key, Project, User};
pub use repository::{InMemoryJobRepository, JobRepository, NotificationOwner};

/// Store error
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct StoreError(#[from] StoreErrorKind);

/// Specific store error kinds
#[derive(Debug, thiserror::Error)]
pub enum StoreErrorKind {
    #[error("job not found: {id}")]
    JobNotFound { id: u64 },

    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: u64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("store backend error: {reason}")]
    Backend { reason: String },
}

impl StoreError {
    /// Wraps a backend failure
    pub fn backend(reason: impl std::fmt::Display) -> Self {
        Self(StoreErrorKind::Backend {
            reason: reason.to_string(),
        })
    }
}

/// Store result type
pub type StoreResult<T = ()> = Result<T, StoreError>;

/// Notification delivery error
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct NotifyError(#[from] NotifyErrorKind);

/// Specific notification error kinds
#[derive(Debug, thiserror::Error)]
pub enum NotifyErrorKind {
    #[error("invalid address {address}: {reason}")]
    Address { address: String, reason: String },

    #[error("mail delivery failed: {reason}")]
    Mail { reason: String },

    #[error("webhook {url} failed: {reason}")]
    Webhook { url: String, reason: String },

    #[error("webhook {url} answered {status}")]
    Rejected { url: String, status: u16 },
}

/// Notification result type
pub type NotifyResult<T = ()> = Result<T, NotifyError>;

/// Shipwright Core version
pub const VERSION: &str = "0.1.0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err: StoreError = StoreErrorKind::JobNotFound { id: 7 }.into();
        assert_eq!(err.to_string(), "job not found: 7");
        assert_eq!(
            StoreError::backend("connection reset").to_string(),
            "store backend error: connection reset"
        );
    }
}
