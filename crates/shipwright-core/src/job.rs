//! Job definitions and the status lifecycle.
//!
//! A job moves `Pending -> Processing -> {Completed | Failed}`. Terminal states
//! are final: [`JobStatus::can_transition_to`] rejects every transition out of
//! them, and the execution state machine relies on that check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::project::{Application, Inventory, Key, User};

/// Kind of work a job requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Run a playbook against an inventory
    Job,
    /// Deploy a versioned application
    Deployment,
    /// Synchronize the project repository only
    ScmPull,
}

impl JobType {
    /// Wire tag of the job type
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Deployment => "deployment",
            Self::ScmPull => "scm_pull",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job" => Ok(Self::Job),
            "deployment" => Ok(Self::Deployment),
            "scm_pull" => Ok(Self::ScmPull),
            other => Err(other.to_string()),
        }
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting in the queue
    #[default]
    #[serde(rename = "queued")]
    Pending,
    /// Picked up by a worker
    #[serde(rename = "processing")]
    Processing,
    /// Finished successfully
    #[serde(rename = "completed")]
    Completed,
    /// Finished with an error
    #[serde(rename = "failed")]
    Failed,
}

impl JobStatus {
    /// Wire tag of the status
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Completed` and `Failed`
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if a job in this status may move to `next`
    #[must_use]
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Processing | Self::Completed | Self::Failed) => true,
            (Self::Processing, Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(other.to_string()),
        }
    }
}

/// A persisted job record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: u64,
    /// Job type
    #[serde(rename = "type")]
    pub job_type: Option<JobType>,
    /// Current status
    pub status: JobStatus,
    /// Entered `Processing` at
    pub started_at: Option<DateTime<Utc>>,
    /// Entered a terminal status at
    pub finished_at: Option<DateTime<Utc>>,
    /// Project referenced directly by the job
    pub project_id: Option<u64>,
    /// Target inventory
    pub inventory: Option<Inventory>,
    /// Deployed application
    pub application: Option<Application>,
    /// SSH key handed to the playbook
    pub key: Option<Key>,
    /// Vault password file
    pub vault_key: Option<Key>,
    /// Playbook path relative to the checkout
    pub playbook: String,
    /// YAML extra variables stored with the job
    pub extra_variables: String,
    /// Version being deployed
    pub version: String,
    /// User who launched the job
    pub user: Option<User>,
}

impl Job {
    /// Creates a pending job
    #[must_use]
    pub fn new(id: u64, job_type: JobType) -> Self {
        Self {
            id,
            job_type: Some(job_type),
            ..Self::default()
        }
    }

    /// Sets the inventory
    #[must_use]
    pub fn with_inventory(mut self, inventory: Inventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Sets the application
    #[must_use]
    pub fn with_application(mut self, application: Application) -> Self {
        self.application = Some(application);
        self
    }

    /// Sets the project referenced by the job itself
    #[must_use]
    pub fn with_project(mut self, project_id: u64) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Sets the playbook
    #[must_use]
    pub fn with_playbook(mut self, playbook: impl Into<String>) -> Self {
        self.playbook = playbook.into();
        self
    }

    /// Sets the SSH key
    #[must_use]
    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    /// Sets the vault key
    #[must_use]
    pub fn with_vault_key(mut self, key: Key) -> Self {
        self.vault_key = Some(key);
        self
    }

    /// Sets the stored extra variables
    #[must_use]
    pub fn with_extra_variables(mut self, vars: impl Into<String>) -> Self {
        self.extra_variables = vars.into();
        self
    }

    /// Sets the deployed version
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Resolves the project owning the job's checkout.
    ///
    /// The inventory's project wins over the application's, which wins over
    /// the job's own reference.
    #[must_use]
    pub fn owning_project_id(&self) -> Option<u64> {
        self.inventory
            .as_ref()
            .and_then(|i| i.project_id)
            .or_else(|| self.application.as_ref().and_then(|a| a.project_id))
            .or(self.project_id)
    }

    /// Applies a status transition with its timestamp.
    ///
    /// Returns false, leaving the job untouched, when the transition is not
    /// allowed.
    pub fn transition(&mut self, next: JobStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match next {
            JobStatus::Processing => self.started_at = Some(at),
            JobStatus::Completed | JobStatus::Failed => self.finished_at = Some(at),
            JobStatus::Pending => {}
        }
        true
    }
}

/// One line of captured job output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLog {
    /// Owning job
    pub job_id: u64,
    /// Line content
    pub message: String,
    /// Persisted at
    pub created_at: DateTime<Utc>,
}
