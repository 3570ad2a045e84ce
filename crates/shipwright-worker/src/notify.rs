//! Completion notifications.
//!
//! Delivery failures are reported in the job log and never change the job
//! outcome.

use shipwright_core::{
    Job, JobRepository, MailSender, NotificationScope, NotificationType, Recipients, WebhookSender,
};
use shipwright_executor::LineSink;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::render;

/// Delivers completion notifications through the configured senders
#[derive(Clone, Default)]
pub struct Notifier {
    mail: Option<Arc<dyn MailSender>>,
    webhooks: Option<Arc<dyn WebhookSender>>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("mail", &self.mail.is_some())
            .field("webhooks", &self.webhooks.is_some())
            .finish()
    }
}

impl Notifier {
    /// Creates a notifier without senders
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends emails through `sender`
    #[must_use]
    pub fn with_mail(mut self, sender: Arc<dyn MailSender>) -> Self {
        self.mail = Some(sender);
        self
    }

    /// Posts webhooks through `sender`
    #[must_use]
    pub fn with_webhooks(mut self, sender: Arc<dyn WebhookSender>) -> Self {
        self.webhooks = Some(sender);
        self
    }

    /// Notifies the recipients of a finished job
    pub async fn notify(&self, repo: &dyn JobRepository, job: &Job, log: &dyn LineSink) {
        let kind = NotificationType::for_status(job.status);
        let scope = NotificationScope::for_job(job);
        let notifications = match repo.related_notifications(&scope).await {
            Ok(notifications) => notifications,
            Err(err) => {
                warn!(job_id = job.id, error = %err, "cannot load notification settings");
                return;
            }
        };
        let recipients = Recipients::collect(&notifications, kind);
        if recipients.is_empty() {
            debug!(job_id = job.id, %kind, "no notification recipients");
            return;
        }

        self.send_emails(repo, job, kind, &recipients, log).await;
        self.send_webhooks(job, kind, &recipients, log).await;
    }

    async fn send_emails(
        &self,
        repo: &dyn JobRepository,
        job: &Job,
        kind: NotificationType,
        recipients: &Recipients,
        log: &dyn LineSink,
    ) {
        if recipients.emails.is_empty() {
            return;
        }
        let Some(mail) = &self.mail else {
            warn!(job_id = job.id, "email recipients configured but no mail sender");
            return;
        };

        let logs = repo.logs(job.id).await.unwrap_or_else(|err| {
            warn!(job_id = job.id, error = %err, "cannot load job log for notification");
            Vec::new()
        });
        let subject = render::title(job, kind);
        let body = render::html(job, kind, &logs);
        for address in &recipients.emails {
            match mail.send(address, &subject, &body).await {
                Ok(()) => info!(job_id = job.id, to = %address, "notification email sent"),
                Err(err) => {
                    warn!(job_id = job.id, to = %address, error = %err, "cannot send email");
                    log.line(format!("Error sending email: {err}")).await;
                }
            }
        }
    }

    async fn send_webhooks(
        &self,
        job: &Job,
        kind: NotificationType,
        recipients: &Recipients,
        log: &dyn LineSink,
    ) {
        if recipients.webhooks.is_empty() {
            return;
        }
        let Some(webhooks) = &self.webhooks else {
            warn!(job_id = job.id, "webhook recipients configured but no webhook sender");
            return;
        };

        let title = render::title(job, kind);
        let text = render::text(job, kind);
        for url in &recipients.webhooks {
            match webhooks.send(url, &title, &text).await {
                Ok(()) => info!(job_id = job.id, %url, "notification webhook sent"),
                Err(err) => {
                    warn!(job_id = job.id, %url, error = %err, "cannot send webhook");
                    log.line(format!("Error sending webhook: {err}")).await;
                }
            }
        }
    }
}
