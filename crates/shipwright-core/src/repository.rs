//! Job repository contract and an in-memory implementation.
//!
//! Persistence of jobs, projects and notification settings belongs to an
//! external store. The worker only talks to it through [`JobRepository`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::job::{Job, JobLog, JobStatus};
use crate::notification::{NotificationScope, RelatedNotification};
use crate::project::Project;
use crate::{StoreErrorKind, StoreResult};

/// Access to persisted jobs and their related records
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Loads a job with its inventory, application, keys and user
    async fn job(&self, id: u64) -> StoreResult<Option<Job>>;

    /// Loads a project with its SSH key
    async fn project(&self, id: u64) -> StoreResult<Option<Project>>;

    /// Records a status change.
    ///
    /// `Processing` stamps the start time, terminal statuses stamp the finish
    /// time.
    async fn update_status(&self, id: u64, status: JobStatus, at: DateTime<Utc>)
    -> StoreResult<()>;

    /// Appends one line to the job log
    async fn append_log(&self, job_id: u64, message: &str) -> StoreResult<()>;

    /// Returns the job log in append order
    async fn logs(&self, job_id: u64) -> StoreResult<Vec<JobLog>>;

    /// Returns the notification channels that apply to `scope`
    async fn related_notifications(
        &self,
        scope: &NotificationScope,
    ) -> StoreResult<Vec<RelatedNotification>>;
}

/// Owner of a notification setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationOwner {
    /// Attached to a job
    Job(u64),
    /// Attached to a project
    Project(u64),
    /// Attached to an application
    Application(u64),
}

impl NotificationOwner {
    fn matches(&self, scope: &NotificationScope) -> bool {
        match (*self, *scope) {
            (Self::Job(id), NotificationScope::Job { job_id }) => id == job_id,
            (Self::Project(id), NotificationScope::Deployment { project_id, .. }) => {
                project_id == Some(id)
            }
            (Self::Application(id), NotificationScope::Deployment { application_id, .. }) => {
                application_id == Some(id)
            }
            _ => false,
        }
    }
}

/// Thread-safe in-memory repository
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobRepository {
    jobs: Arc<DashMap<u64, Job>>,
    projects: Arc<DashMap<u64, Project>>,
    logs: Arc<DashMap<u64, Vec<JobLog>>>,
    notifications: Arc<RwLock<Vec<(NotificationOwner, RelatedNotification)>>>,
}

impl InMemoryJobRepository {
    /// Creates an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a job
    pub fn insert_job(&self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    /// Stores a project
    pub fn insert_project(&self, project: Project) {
        self.projects.insert(project.id, project);
    }

    /// Attaches a notification channel
    pub fn insert_notification(&self, owner: NotificationOwner, notification: RelatedNotification) {
        self.notifications.write().push((owner, notification));
    }

    /// Returns the stored copy of a job
    #[must_use]
    pub fn get_job(&self, id: u64) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.value().clone())
    }

    /// Returns the log messages of a job
    #[must_use]
    pub fn log_messages(&self, job_id: u64) -> Vec<String> {
        self.logs
            .get(&job_id)
            .map(|l| l.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn job(&self, id: u64) -> StoreResult<Option<Job>> {
        Ok(self.get_job(id))
    }

    async fn project(&self, id: u64) -> StoreResult<Option<Project>> {
        Ok(self.projects.get(&id).map(|p| p.value().clone()))
    }

    async fn update_status(
        &self,
        id: u64,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut job = self
            .jobs
            .get_mut(&id)
            .ok_or(StoreErrorKind::JobNotFound { id })?;
        let from = job.status;
        if !job.transition(status, at) {
            return Err(StoreErrorKind::InvalidTransition {
                id,
                from,
                to: status,
            }
            .into());
        }
        Ok(())
    }

    async fn append_log(&self, job_id: u64, message: &str) -> StoreResult<()> {
        self.logs.entry(job_id).or_default().push(JobLog {
            job_id,
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn logs(&self, job_id: u64) -> StoreResult<Vec<JobLog>> {
        Ok(self
            .logs
            .get(&job_id)
            .map(|l| l.value().clone())
            .unwrap_or_default())
    }

    async fn related_notifications(
        &self,
        scope: &NotificationScope,
    ) -> StoreResult<Vec<RelatedNotification>> {
        Ok(self
            .notifications
            .read()
            .iter()
            .filter(|(owner, _)| owner.matches(scope))
            .map(|(_, n)| n.clone())
            .collect())
    }
}
