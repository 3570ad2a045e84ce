//! # Shipwright Executor
//!
//! Everything a job does on the worker's machine: synchronising a project
//! checkout, writing key material, and running the automation command with
//! its output streamed line by line.
//!
//! ## Architecture
//!
//! - `sink`: The `LineSink` trait receiving captured output and progress lines
//! - `command`: Child process execution with two concurrent line scanners
//! - `git`: The `GitBackend` trait and its `git` CLI implementation
//! - `sync`: The repository synchronisation protocol (clone or fetch, then
//!   hard reset to the remote branch tip)
//! - `storage`: On-disk layout for checkouts and key files
//! - `playbook`: Extra-variables file and automation command builder
//!
//! ## Example
//!
//! ```rust,ignore
//! use shipwright_executor::{CommandRunner, CommandSpec};
//!
//! let spec = CommandSpec::new("ansible-playbook").arg("site.yml");
//! let status = CommandRunner::new().run(&spec, sink).await?;
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod command;
pub mod git;
pub mod playbook;
pub mod sink;
pub mod storage;
pub mod sync;

pub use command::{CommandRunner, CommandSpec};
pub use git::{FetchOutcome, GitBackend, GitCli};
#[cfg(any(test, feature = "test-support"))]
pub use git::RecordingGit;
pub use playbook::{ExtraVarsFile, PlaybookInvocation, WORKER_MARKER};
pub use sink::{LineSink, SharedSink, split_line};
#[cfg(any(test, feature = "test-support"))]
pub use sink::CollectingSink;
pub use storage::StorageLayout;
pub use sync::RepositorySync;

/// Executor result type
pub type ExecutorResult<T = ()> = Result<T, ExecutorError>;

/// Executor error
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ExecutorError(#[from] ExecutorErrorKind);

/// Specific error kinds
#[derive(Debug, thiserror::Error)]
pub enum ExecutorErrorKind {
    #[error("cannot start {program}: {reason}")]
    Spawn {
        program: String,
        reason: std::io::Error,
    },

    #[error("SSH key is required for SSH protocol")]
    SshKeyRequired,

    #[error("git {operation}: {reason}")]
    Git {
        operation: &'static str,
        reason: String,
    },

    #[error("I/O error: {reason}")]
    IoError { reason: std::io::Error },
}

impl ExecutorError {
    /// Returns the specific error kind
    #[must_use]
    pub fn kind(&self) -> &ExecutorErrorKind {
        &self.0
    }

    pub(crate) fn git(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        Self(ExecutorErrorKind::Git {
            operation,
            reason: reason.to_string(),
        })
    }
}

impl From<std::io::Error> for ExecutorError {
    fn from(e: std::io::Error) -> Self {
        Self(ExecutorErrorKind::IoError { reason: e })
    }
}
