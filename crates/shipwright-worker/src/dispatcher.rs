//! Job dispatcher.
//!
//! Takes job requests from the subscriber's rendezvous channel and runs them
//! one at a time. A request is only taken when the dispatcher is idle, so
//! cancellation never strands an acknowledged job. Each job gets its own log fanout, opened before the job is
//! loaded and closed after its terminal status and notifications.

use shipwright_broker::{Connector, DialPolicy, HandoffReceiver};
use shipwright_core::{JobMessage, JobRepository, JobStatus, JobType};
use shipwright_executor::{CommandRunner, GitBackend, RepositorySync};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::execution::JobRun;
use crate::logger::{JobLogger, LogFanout};
use crate::notify::Notifier;
use crate::status::StatusPublisher;
use crate::WorkerErrorKind;

/// Default automation command
pub const PLAYBOOK_COMMAND: &str = "ansible-playbook";

/// Drives jobs received from the job queue
pub struct Dispatcher<C, G> {
    pub(crate) repo: Arc<dyn JobRepository>,
    connector: C,
    dial_policy: DialPolicy,
    pub(crate) statuses: StatusPublisher,
    pub(crate) sync: RepositorySync<G>,
    pub(crate) runner: CommandRunner,
    pub(crate) playbook_command: String,
    pub(crate) notifier: Notifier,
    cancel: CancellationToken,
}

impl<C, G> fmt::Debug for Dispatcher<C, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("dial_policy", &self.dial_policy)
            .field("playbook_command", &self.playbook_command)
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

impl<C, G> Dispatcher<C, G>
where
    C: Connector + Clone,
    G: GitBackend,
{
    /// Creates a dispatcher
    ///
    /// `connector` dials the sessions of the per-job log publishers.
    pub fn new(
        repo: Arc<dyn JobRepository>,
        connector: C,
        statuses: StatusPublisher,
        sync: RepositorySync<G>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            repo,
            connector,
            dial_policy: DialPolicy::default(),
            statuses,
            sync,
            runner: CommandRunner::new(),
            playbook_command: PLAYBOOK_COMMAND.to_string(),
            notifier: Notifier::new(),
            cancel,
        }
    }

    /// Dial policy of the per-job log publishers
    #[must_use]
    pub fn with_dial_policy(mut self, policy: DialPolicy) -> Self {
        self.dial_policy = policy;
        self
    }

    /// Automation command run by `job` and `deployment` jobs
    #[must_use]
    pub fn with_playbook_command(mut self, command: impl Into<String>) -> Self {
        self.playbook_command = command.into();
        self
    }

    /// Notification senders
    #[must_use]
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Processes jobs until the channel closes or the dispatcher is cancelled
    ///
    /// A job that has started runs to completion before cancellation is
    /// observed.
    pub async fn run(self, mut jobs: HandoffReceiver) {
        info!("dispatcher started");
        loop {
            let body = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                body = jobs.recv() => match body {
                    Some(body) => body,
                    None => break,
                },
            };
            self.dispatch(&body).await;
        }
        info!("dispatcher stopped");
    }

    /// Processes one job request
    pub async fn dispatch(&self, body: &[u8]) {
        let message = match JobMessage::decode(body) {
            Ok(message) => message,
            Err(err) => {
                error!(
                    error = %err,
                    body = %String::from_utf8_lossy(body),
                    "cannot decode job message"
                );
                return;
            }
        };
        info!(job_id = message.id, job_type = %message.job_type, "job received");

        let (log, fanout) = LogFanout::open(
            self.connector.clone(),
            self.dial_policy,
            &self.cancel,
            message.id,
            self.repo.clone(),
        );
        self.execute(&message, &log).await;
        fanout.close(log).await;
    }

    async fn execute(&self, message: &JobMessage, log: &Arc<JobLogger>) {
        let job_type = message.job_type.parse::<JobType>().ok();
        let job = match self.repo.job(message.id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                let err = WorkerErrorKind::JobNotFound { id: message.id };
                error!(job_id = message.id, "{err}");
                log.publish(&err.to_string()).await;
                self.statuses
                    .publish(job_type, message.id, JobStatus::Failed)
                    .await;
                return;
            }
            Err(err) => {
                error!(job_id = message.id, error = %err, "cannot load job");
                log.publish(&format!("Cannot load job: {err}")).await;
                self.statuses
                    .publish(job_type, message.id, JobStatus::Failed)
                    .await;
                return;
            }
        };

        JobRun::new(self, job, log.clone())
            .execute(&message.job_type)
            .await;
    }
}
