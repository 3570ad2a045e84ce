//! Notification settings and recipient resolution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::NotifyResult;
use crate::job::{Job, JobStatus, JobType};

/// Outcome a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    /// Job completed
    Success,
    /// Job failed
    Fail,
}

impl NotificationType {
    /// Picks the notification type for a terminal status
    #[must_use]
    pub fn for_status(status: JobStatus) -> Self {
        if status == JobStatus::Completed {
            Self::Success
        } else {
            Self::Fail
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Fail => f.write_str("fail"),
        }
    }
}

/// Where a notification channel delivers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelTarget {
    /// Comma-separated list of addresses
    Email {
        /// Raw recipient list
        recipients: String,
    },
    /// Address of a registered user
    UserEmail {
        /// Resolved user address
        email: String,
    },
    /// HTTP endpoint
    Webhook {
        /// Endpoint URL
        url: String,
    },
}

/// A notification channel attached to a job, template, project or application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedNotification {
    /// Notify on success
    pub success_enabled: bool,
    /// Notify on failure
    pub fail_enabled: bool,
    /// Delivery target
    pub target: ChannelTarget,
}

impl RelatedNotification {
    /// Returns true if this channel wants notifications of the given type
    #[must_use]
    pub fn enabled_for(&self, kind: NotificationType) -> bool {
        match kind {
            NotificationType::Success => self.success_enabled,
            NotificationType::Fail => self.fail_enabled,
        }
    }
}

/// Which notification settings apply to a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationScope {
    /// Settings of a deployment's project and application
    Deployment {
        /// Job ID
        job_id: u64,
        /// Owning project
        project_id: Option<u64>,
        /// Deployed application
        application_id: Option<u64>,
    },
    /// Settings attached to the job itself
    Job {
        /// Job ID
        job_id: u64,
    },
}

impl NotificationScope {
    /// Derives the scope from the job type
    #[must_use]
    pub fn for_job(job: &Job) -> Self {
        match job.job_type {
            Some(JobType::Deployment) => Self::Deployment {
                job_id: job.id,
                project_id: job.owning_project_id(),
                application_id: job.application.as_ref().map(|a| a.id),
            },
            _ => Self::Job { job_id: job.id },
        }
    }
}

/// Deduplicated notification recipients
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients {
    /// Email addresses
    pub emails: BTreeSet<String>,
    /// Webhook URLs
    pub webhooks: BTreeSet<String>,
}

impl Recipients {
    /// Collects the recipients of every channel enabled for `kind`
    #[must_use]
    pub fn collect(notifications: &[RelatedNotification], kind: NotificationType) -> Self {
        let mut recipients = Self::default();
        for notification in notifications.iter().filter(|n| n.enabled_for(kind)) {
            match &notification.target {
                ChannelTarget::Email { recipients: list } => {
                    recipients.emails.extend(
                        list.split(',')
                            .map(str::trim)
                            .filter(|e| !e.is_empty())
                            .map(str::to_string),
                    );
                }
                ChannelTarget::UserEmail { email } => {
                    let email = email.trim();
                    if !email.is_empty() {
                        recipients.emails.insert(email.to_string());
                    }
                }
                ChannelTarget::Webhook { url } => {
                    if !url.is_empty() {
                        recipients.webhooks.insert(url.clone());
                    }
                }
            }
        }
        recipients
    }

    /// Returns true when nobody is to be notified
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.webhooks.is_empty()
    }
}

/// Delivers notification emails
#[async_trait]
pub trait MailSender: Send + Sync {
    /// Sends one HTML message to one address
    async fn send(&self, to: &str, subject: &str, html: &str) -> NotifyResult;
}

/// Delivers notification webhooks
#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// Posts a title and a plain-text body to `url`
    async fn send(&self, url: &str, title: &str, text: &str) -> NotifyResult;
}
