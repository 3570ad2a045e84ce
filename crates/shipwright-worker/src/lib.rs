//! # Shipwright Worker
//!
//! Turns job requests into executed jobs. This crate provides the dispatcher
//! reading the job channel, the per-job execution state machine, and the log,
//! status and notification fanout around it.
//!
//! ## Architecture
//!
//! The worker is organized around:
//!
//! - `dispatcher`: Decodes job requests and drives one job at a time
//! - `execution`: The job state machine and the per-type handlers
//! - `logger`: Per-job log lines, persisted and published live
//! - `status`: Status change events on the shared status exchange
//! - `notify`: Completion notifications by email and webhook
//! - `render`: Notification titles and bodies
//!
//! ## Example
//!
//! ```rust,ignore
//! use shipwright_worker::{Dispatcher, StatusPublisher};
//!
//! let dispatcher = Dispatcher::new(repo, connector, StatusPublisher::new(statuses), sync, cancel)
//!     .with_playbook_command("ansible-playbook");
//! dispatcher.run(jobs).await;
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod dispatcher;
pub mod execution;
pub mod logger;
pub mod notify;
pub mod render;
pub mod status;

pub use dispatcher::Dispatcher;
pub use logger::{JobLogger, LogFanout};
pub use notify::Notifier;
pub use status::StatusPublisher;

use shipwright_core::StoreError;
use shipwright_executor::ExecutorError;

/// Worker error types
///
/// The display text of each kind is what ends up in the job log.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct WorkerError(#[from] WorkerErrorKind);

/// Specific error kinds
#[derive(Debug, thiserror::Error)]
pub enum WorkerErrorKind {
    #[error("Job with ID {id} not found")]
    JobNotFound { id: u64 },

    #[error("Unsupported job type: {tag}")]
    UnsupportedType { tag: String },

    #[error("Project not found")]
    ProjectNotFound,

    #[error("Job has no inventory")]
    MissingInventory,

    #[error("Cannot synchronize project: {reason}")]
    Sync { reason: ExecutorError },

    #[error("Cannot write key: {reason}")]
    Key { reason: ExecutorError },

    #[error("Cannot create extra variables file: {reason}")]
    ExtraVars { reason: ExecutorError },

    #[error("Cannot start command: {reason}")]
    Start { reason: ExecutorError },

    #[error("Command failed: {status}")]
    CommandFailed { status: String },

    #[error("Store error: {reason}")]
    Store { reason: StoreError },
}

impl WorkerError {
    /// Returns the specific error kind
    #[must_use]
    pub fn kind(&self) -> &WorkerErrorKind {
        &self.0
    }
}

impl From<StoreError> for WorkerError {
    fn from(e: StoreError) -> Self {
        Self(WorkerErrorKind::Store { reason: e })
    }
}

/// Worker result type
pub type WorkerResult<T = ()> = Result<T, WorkerError>;
