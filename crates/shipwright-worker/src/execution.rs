//! Job execution state machine.
//!
//! A loaded job moves `Pending -> Processing -> {Completed | Failed}`. Jobs
//! that cannot start (unsupported type, missing project) go straight from
//! `Pending` to `Failed`. Every applied transition is recorded in the store
//! first and then published as a status event; a transition the current
//! status does not allow is skipped, so redelivered finished jobs are left
//! alone.
//!
//! Failures inside a job become a log line and a `Failed` status. They never
//! leave this module as errors.

use chrono::Utc;
use shipwright_broker::Connector;
use shipwright_core::{Job, JobStatus, JobType, Key, Project};
use shipwright_executor::{ExtraVarsFile, GitBackend, LineSink, PlaybookInvocation};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::logger::JobLogger;
use crate::{WorkerError, WorkerErrorKind, WorkerResult};

/// One job being executed
pub(crate) struct JobRun<'a, C, G> {
    dispatcher: &'a Dispatcher<C, G>,
    job: Job,
    log: Arc<JobLogger>,
}

impl<'a, C, G> JobRun<'a, C, G>
where
    C: Connector + Clone,
    G: GitBackend,
{
    pub(crate) fn new(dispatcher: &'a Dispatcher<C, G>, job: Job, log: Arc<JobLogger>) -> Self {
        Self {
            dispatcher,
            job,
            log,
        }
    }

    /// Runs the handler for the requested job type to a terminal status
    pub(crate) async fn execute(mut self, tag: &str) {
        let Ok(job_type) = tag.parse::<JobType>() else {
            let err = WorkerErrorKind::UnsupportedType {
                tag: tag.to_string(),
            };
            self.fail_before_start(err.into()).await;
            return;
        };
        if self.job.job_type.is_none() {
            self.job.job_type = Some(job_type);
        }

        let project = match self.project().await {
            Ok(project) => project,
            Err(err) => {
                self.fail_before_start(err).await;
                return;
            }
        };

        if !self.transition(JobStatus::Processing).await {
            return;
        }

        let outcome = match job_type {
            JobType::ScmPull => self.synchronize(&project).await.map(|_| ()),
            JobType::Job | JobType::Deployment => self.run_playbook(&project, job_type).await,
        };
        let status = match outcome {
            Ok(()) => JobStatus::Completed,
            Err(err) => {
                self.report(&err).await;
                JobStatus::Failed
            }
        };
        self.finish(status).await;
    }

    async fn fail_before_start(&mut self, err: WorkerError) {
        warn!(job_id = self.job.id, error = %err, "job cannot start");
        self.report(&err).await;
        self.finish(JobStatus::Failed).await;
    }

    async fn finish(&mut self, status: JobStatus) {
        if self.transition(status).await {
            self.dispatcher
                .notifier
                .notify(self.dispatcher.repo.as_ref(), &self.job, self.log.as_ref())
                .await;
        }
    }

    async fn transition(&mut self, status: JobStatus) -> bool {
        let id = self.job.id;
        let from = self.job.status;
        if !from.can_transition_to(status) {
            warn!(job_id = id, %from, to = %status, "skipping status transition");
            return false;
        }

        let at = Utc::now();
        if let Err(err) = self.dispatcher.repo.update_status(id, status, at).await {
            error!(job_id = id, %status, error = %err, "cannot record job status");
            self.line(WorkerError::from(err).to_string()).await;
            return false;
        }
        self.job.transition(status, at);
        self.dispatcher
            .statuses
            .publish(self.job.job_type, id, status)
            .await;
        info!(job_id = id, %from, to = %status, "job status changed");
        true
    }

    async fn project(&self) -> WorkerResult<Project> {
        let id = self
            .job
            .owning_project_id()
            .ok_or(WorkerErrorKind::ProjectNotFound)?;
        self.dispatcher
            .repo
            .project(id)
            .await?
            .ok_or_else(|| WorkerErrorKind::ProjectNotFound.into())
    }

    async fn synchronize(&self, project: &Project) -> WorkerResult<PathBuf> {
        self.dispatcher
            .sync
            .synchronize(project, self.log.clone())
            .await
            .map_err(|reason| WorkerErrorKind::Sync { reason }.into())
    }

    async fn run_playbook(&self, project: &Project, job_type: JobType) -> WorkerResult {
        let inventory = self
            .job
            .inventory
            .as_ref()
            .ok_or(WorkerErrorKind::MissingInventory)?;
        let checkout = self.synchronize(project).await?;
        let private_key = self.write_key(self.job.key.as_ref()).await?;
        let vault_key = self.write_key(self.job.vault_key.as_ref()).await?;

        let vars = ExtraVarsFile::write(&self.job.extra_variables)
            .map_err(|reason| WorkerErrorKind::ExtraVars { reason })?;
        self.line(format!("extra vars: \n{}", vars.contents())).await;

        let mut invocation = PlaybookInvocation::new(
            self.dispatcher.playbook_command.clone(),
            inventory.source_file.clone(),
            self.job.playbook.clone(),
            checkout.clone(),
        );
        if let Some(key) = private_key {
            invocation = invocation.private_key(key);
        }
        if job_type == JobType::Deployment {
            let app = self
                .job
                .application
                .as_ref()
                .map(|a| a.ansible_name.clone())
                .unwrap_or_default();
            invocation = invocation
                .variable("app", app)
                .variable("version", self.job.version.clone());
        }
        invocation = invocation.extra_vars_file(vars.path());
        if let Some(key) = vault_key {
            invocation = invocation.vault_key(key);
        }

        let command = invocation.to_command();
        self.line(command.command_line()).await;
        self.line(format!("working directory: {}", checkout.display()))
            .await;
        info!(job_id = self.job.id, command = %command.command_line(), "starting command");

        let status = self
            .dispatcher
            .runner
            .run(&command, self.log.clone())
            .await
            .map_err(|reason| WorkerErrorKind::Start { reason })?;
        drop(vars);

        if !status.success() {
            return Err(WorkerErrorKind::CommandFailed {
                status: status.to_string(),
            }
            .into());
        }
        self.line(format!("Command finished: {status}")).await;
        Ok(())
    }

    async fn write_key(&self, key: Option<&Key>) -> WorkerResult<Option<PathBuf>> {
        let Some(key) = key else {
            return Ok(None);
        };
        let path = self
            .dispatcher
            .sync
            .layout()
            .write_key(key)
            .await
            .map_err(|reason| WorkerErrorKind::Key { reason })?;
        Ok(Some(path))
    }

    async fn report(&self, err: &WorkerError) {
        // synchronisation writes its own failure line
        if matches!(err.kind(), WorkerErrorKind::Sync { .. }) {
            return;
        }
        self.line(err.to_string()).await;
    }

    async fn line(&self, line: String) {
        self.log.line(line).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::notify::recording::RecordingSender;
    use crate::status::StatusPublisher;
    use pretty_assertions::assert_eq;
    use async_trait::async_trait;
    use chrono::DateTime;
    use shipwright_broker::{
        DialPolicy, MemoryBroker, MemoryConnector, Message, QueuedSubscriber, SessionFactory, bus,
    };
    use shipwright_core::{
        Application, ChannelTarget, InMemoryJobRepository, Inventory, JobLog, JobRepository,
        NotificationOwner, NotificationScope, RelatedNotification, StatusMessage, StoreError,
        StoreResult,
    };
    use shipwright_executor::{RecordingGit, RepositorySync, StorageLayout};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const REPO_URL: &str = "https://git.example.com/ops/playbooks.git";

    struct Harness {
        broker: MemoryBroker,
        repo: InMemoryJobRepository,
        git: Arc<RecordingGit>,
        storage: TempDir,
        statuses: mpsc::Receiver<Message>,
        cancel: CancellationToken,
        dispatcher: Dispatcher<MemoryConnector, Arc<RecordingGit>>,
    }

    impl Harness {
        fn new(script: &str) -> Self {
            Self::with_git(RecordingGit::new(), script)
        }

        fn with_git(git: RecordingGit, script: &str) -> Self {
            let storage = tempfile::tempdir().unwrap();
            let program = storage.path().join("playbook.sh");
            std::fs::write(&program, format!("#!/bin/sh\n{script}\n")).unwrap();
            std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

            let broker = MemoryBroker::new();
            let repo = InMemoryJobRepository::new();
            repo.insert_project(Project {
                id: 1,
                name: "playbooks".to_string(),
                repo_url: REPO_URL.to_string(),
                repo_branch: "main".to_string(),
                ..Project::default()
            });
            let git = Arc::new(git);
            let (tx, statuses) = mpsc::channel(16);
            let sync = RepositorySync::new(git.clone(), StorageLayout::new(storage.path()));
            let cancel = CancellationToken::new();
            let dispatcher = Dispatcher::new(
                Arc::new(repo.clone()),
                broker.connector(),
                StatusPublisher::new(tx),
                sync,
                cancel.clone(),
            )
            .with_playbook_command(program.to_string_lossy());

            Self {
                broker,
                repo,
                git,
                storage,
                statuses,
                cancel,
                dispatcher,
            }
        }

        fn statuses(&mut self) -> Vec<(String, u64, JobStatus)> {
            drain_statuses(&mut self.statuses)
        }
    }

    fn drain_statuses(rx: &mut mpsc::Receiver<Message>) -> Vec<(String, u64, JobStatus)> {
        let mut statuses = Vec::new();
        while let Ok(body) = rx.try_recv() {
            let message: StatusMessage = serde_json::from_slice(&body).unwrap();
            statuses.push((message.job_type, message.id, message.status));
        }
        statuses
    }

    fn staging() -> Inventory {
        Inventory {
            id: 1,
            name: "staging".to_string(),
            source_file: "hosts.ini".to_string(),
            project_id: Some(1),
        }
    }

    #[tokio::test]
    async fn test_job_completes() {
        let mut h = Harness::new("echo 'PLAY [all]'\necho 'warning' >&2\nexit 0");
        h.repo.insert_job(
            Job::new(42, JobType::Job)
                .with_inventory(staging())
                .with_playbook("site.yml")
                .with_extra_variables("region: eu"),
        );

        h.dispatcher.dispatch(br#"{"id":42,"type":"job"}"#).await;

        assert_eq!(
            h.statuses(),
            vec![
                ("job".to_string(), 42, JobStatus::Processing),
                ("job".to_string(), 42, JobStatus::Completed),
            ]
        );
        let job = h.repo.get_job(42).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.is_some() && job.finished_at.is_some());

        let logs = h.repo.log_messages(42);
        assert!(logs.contains(&"extra vars: \nregion: eu\nshipwright_worker: true\n".to_string()));
        let command = logs
            .iter()
            .find(|l| l.contains("playbook.sh -i hosts.ini -e @"))
            .expect("command line logged");
        assert!(command.ends_with(".yml site.yml"));
        let checkout = h.storage.path().join("repositories/1");
        assert!(logs.contains(&format!("working directory: {}", checkout.display())));
        assert!(logs.contains(&"PLAY [all]".to_string()));
        assert!(logs.contains(&"warning".to_string()));
        assert_eq!(
            logs.last().map(String::as_str),
            Some("Command finished: exit status: 0")
        );

        assert_eq!(h.broker.published_text("job_log_42"), logs);
        assert_eq!(
            h.git.calls(),
            vec![
                format!("clone {REPO_URL}"),
                "resolve origin/main".to_string(),
                format!("reset {}", RecordingGit::COMMIT),
            ]
        );
    }

    #[tokio::test]
    async fn test_deployment_with_missing_project_fails_without_processing() {
        let mut h = Harness::new("echo 'should not run'");
        h.repo.insert_job(
            Job::new(7, JobType::Deployment)
                .with_application(Application {
                    id: 3,
                    project_id: Some(99),
                    ..Application::default()
                })
                .with_playbook("deploy.yml"),
        );

        h.dispatcher.dispatch(br#"{"id":7,"type":"deployment"}"#).await;

        assert_eq!(
            h.statuses(),
            vec![("deployment".to_string(), 7, JobStatus::Failed)]
        );
        assert_eq!(h.repo.log_messages(7), vec!["Project not found".to_string()]);
        assert!(h.git.calls().is_empty());
        let job = h.repo.get_job(7).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn test_ssh_project_without_key_fails_before_git() {
        let mut h = Harness::new("exit 0");
        h.repo.insert_project(Project {
            id: 2,
            repo_url: "git@git.example.com:ops/playbooks.git".to_string(),
            repo_branch: "main".to_string(),
            ..Project::default()
        });
        h.repo.insert_job(Job::new(11, JobType::ScmPull).with_project(2));

        h.dispatcher.dispatch(br#"{"id":11,"type":"scm_pull"}"#).await;

        assert_eq!(
            h.statuses(),
            vec![
                ("scm_pull".to_string(), 11, JobStatus::Processing),
                ("scm_pull".to_string(), 11, JobStatus::Failed),
            ]
        );
        assert_eq!(
            h.repo.log_messages(11),
            vec!["SSH key is required for SSH protocol".to_string()]
        );
        assert!(h.git.calls().is_empty());
    }

    #[tokio::test]
    async fn test_scm_pull_synchronizes_only() {
        let mut h = Harness::new("echo 'should not run'");
        h.repo.insert_job(Job::new(12, JobType::ScmPull).with_project(1));

        h.dispatcher.dispatch(br#"{"id":12,"type":"scm_pull"}"#).await;

        assert_eq!(
            h.statuses()
                .into_iter()
                .map(|(_, _, status)| status)
                .collect::<Vec<_>>(),
            vec![JobStatus::Processing, JobStatus::Completed]
        );
        let logs = h.repo.log_messages(12);
        assert_eq!(logs.first(), Some(&format!("git clone {REPO_URL}")));
        assert_eq!(logs.last().map(String::as_str), Some("Repository up to date"));
        assert!(!logs.iter().any(|l| l.contains("should not run")));
    }

    #[tokio::test]
    async fn test_sync_failure_fails_job() {
        let mut h = Harness::with_git(RecordingGit::new().failing("clone"), "exit 0");
        h.repo.insert_job(Job::new(13, JobType::Job).with_inventory(staging()));

        h.dispatcher.dispatch(br#"{"id":13,"type":"job"}"#).await;

        let statuses: Vec<_> = h.statuses().into_iter().map(|(_, _, s)| s).collect();
        assert_eq!(statuses, vec![JobStatus::Processing, JobStatus::Failed]);
        assert_eq!(
            h.repo.log_messages(13),
            vec![
                format!("git clone {REPO_URL}"),
                "git clone: simulated failure".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_deployment_passes_app_version_and_keys() {
        let mut h = Harness::new("echo \"args: $*\"");
        h.repo.insert_job(
            Job::new(21, JobType::Deployment)
                .with_inventory(staging())
                .with_application(Application {
                    id: 3,
                    name: "Billing".to_string(),
                    ansible_name: "billing".to_string(),
                    project_id: Some(1),
                })
                .with_playbook("deploy.yml")
                .with_version("1.4.2")
                .with_key(Key {
                    id: 4,
                    title: "deploy".to_string(),
                    key: "PRIVATE".to_string(),
                })
                .with_vault_key(Key {
                    id: 5,
                    title: "vault".to_string(),
                    key: "VAULT".to_string(),
                }),
        );

        h.dispatcher.dispatch(br#"{"id":21,"type":"deployment"}"#).await;

        let keys = h.storage.path().join("keys");
        let args = h
            .repo
            .log_messages(21)
            .into_iter()
            .find(|l| l.starts_with("args: "))
            .expect("arguments echoed");
        assert!(args.starts_with(&format!(
            "args: --private-key {} -i hosts.ini -e app=billing -e version=1.4.2 -e @",
            keys.join("4").display()
        )));
        assert!(args.ends_with(&format!(
            "deploy.yml --vault-id {}",
            keys.join("5").display()
        )));
        assert_eq!(std::fs::read_to_string(keys.join("4")).unwrap(), "PRIVATE");
        assert_eq!(
            h.statuses().last().map(|(_, _, s)| *s),
            Some(JobStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_job() {
        let mut h = Harness::new("echo 'fatal: unreachable'\nexit 3");
        h.repo.insert_job(Job::new(14, JobType::Job).with_inventory(staging()));

        h.dispatcher.dispatch(br#"{"id":14,"type":"job"}"#).await;

        assert_eq!(
            h.statuses().last().map(|(_, _, s)| *s),
            Some(JobStatus::Failed)
        );
        assert_eq!(
            h.repo.log_messages(14).last().map(String::as_str),
            Some("Command failed: exit status: 3")
        );
    }

    #[tokio::test]
    async fn test_control_characters_round_trip() {
        let mut h = Harness::new(r"printf '\033[0;32mok\033[0m\tdone\001\r\n'");
        h.repo.insert_job(Job::new(15, JobType::Job).with_inventory(staging()));

        h.dispatcher.dispatch(br#"{"id":15,"type":"job"}"#).await;

        let line = "\x1b[0;32mok\x1b[0m\tdone\x01".to_string();
        assert!(h.repo.log_messages(15).contains(&line));
        assert!(h.broker.published_text("job_log_15").contains(&line));
        assert!(
            h.broker
                .published("job_log_15")
                .contains(&line.as_bytes().to_vec())
        );
        let _ = h.statuses();
    }

    #[tokio::test]
    async fn test_unsupported_type_fails() {
        let mut h = Harness::new("exit 0");
        h.repo.insert_job(Job::new(5, JobType::Job).with_inventory(staging()));

        h.dispatcher.dispatch(br#"{"id":5,"type":"backup"}"#).await;

        assert_eq!(
            h.statuses(),
            vec![("job".to_string(), 5, JobStatus::Failed)]
        );
        assert_eq!(
            h.repo.log_messages(5),
            vec!["Unsupported job type: backup".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_job_is_reported_live_only() {
        let mut h = Harness::new("exit 0");

        h.dispatcher.dispatch(br#"{"id":404,"type":"job"}"#).await;

        assert_eq!(
            h.statuses(),
            vec![("job".to_string(), 404, JobStatus::Failed)]
        );
        assert_eq!(
            h.broker.published_text("job_log_404"),
            vec!["Job with ID 404 not found".to_string()]
        );
        assert!(h.repo.log_messages(404).is_empty());
    }

    #[tokio::test]
    async fn test_garbage_message_is_dropped() {
        let mut h = Harness::new("exit 0");

        h.dispatcher.dispatch(b"not json").await;

        assert!(h.statuses().is_empty());
        assert_eq!(h.broker.dials(), 0);
    }

    #[tokio::test]
    async fn test_finished_job_is_not_run_again() {
        let mut h = Harness::new("echo 'should not run'");
        let mut job = Job::new(16, JobType::Job).with_inventory(staging());
        job.transition(JobStatus::Processing, Utc::now());
        job.transition(JobStatus::Completed, Utc::now());
        h.repo.insert_job(job);

        h.dispatcher.dispatch(br#"{"id":16,"type":"job"}"#).await;

        assert!(h.statuses().is_empty());
        assert!(h.repo.log_messages(16).is_empty());
        assert!(h.git.calls().is_empty());
    }

    #[tokio::test]
    async fn test_completion_is_notified() {
        let mut h = Harness::new("exit 0");
        let hooks = Arc::new(RecordingSender::default());
        h.dispatcher = h
            .dispatcher
            .with_notifier(Notifier::new().with_webhooks(hooks.clone()));
        h.repo.insert_job(Job::new(17, JobType::Job).with_inventory(staging()));
        h.repo.insert_notification(
            NotificationOwner::Job(17),
            RelatedNotification {
                success_enabled: true,
                fail_enabled: false,
                target: ChannelTarget::Webhook {
                    url: "https://hooks.example.com/deploys".to_string(),
                },
            },
        );

        h.dispatcher.dispatch(br#"{"id":17,"type":"job"}"#).await;

        let sent = hooks.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "https://hooks.example.com/deploys");
        assert_eq!(sent[0].1, "Shipwright job #17 success");
        let _ = h.statuses();
    }

    /// Store whose status updates always fail
    struct ReadOnlyStore(InMemoryJobRepository);

    #[async_trait]
    impl JobRepository for ReadOnlyStore {
        async fn job(&self, id: u64) -> StoreResult<Option<Job>> {
            self.0.job(id).await
        }

        async fn project(&self, id: u64) -> StoreResult<Option<Project>> {
            self.0.project(id).await
        }

        async fn update_status(
            &self,
            _id: u64,
            _status: JobStatus,
            _at: DateTime<Utc>,
        ) -> StoreResult<()> {
            Err(StoreError::backend("read-only transaction"))
        }

        async fn append_log(&self, job_id: u64, message: &str) -> StoreResult<()> {
            self.0.append_log(job_id, message).await
        }

        async fn logs(&self, job_id: u64) -> StoreResult<Vec<JobLog>> {
            self.0.logs(job_id).await
        }

        async fn related_notifications(
            &self,
            scope: &NotificationScope,
        ) -> StoreResult<Vec<RelatedNotification>> {
            self.0.related_notifications(scope).await
        }
    }

    #[tokio::test]
    async fn test_status_store_failure_is_logged() {
        let mut h = Harness::new("echo 'should not run'");
        h.dispatcher.repo = Arc::new(ReadOnlyStore(h.repo.clone()));
        h.repo.insert_job(Job::new(18, JobType::Job).with_inventory(staging()));

        h.dispatcher.dispatch(br#"{"id":18,"type":"job"}"#).await;

        assert!(h.statuses().is_empty());
        let line = "Store error: store backend error: read-only transaction".to_string();
        assert_eq!(h.repo.log_messages(18), vec![line.clone()]);
        assert_eq!(h.broker.published_text("job_log_18"), vec![line]);
        assert_eq!(h.repo.get_job(18).unwrap().status, JobStatus::Pending);
        assert!(h.git.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_leaves_waiting_job_queued() {
        const WAIT: Duration = Duration::from_secs(10);

        let Harness {
            broker,
            repo,
            storage: _storage,
            mut statuses,
            cancel,
            dispatcher,
            ..
        } = Harness::new("sleep 0.5\nexit 0");
        for id in [31, 32] {
            repo.insert_job(Job::new(id, JobType::Job).with_inventory(staging()));
            broker.enqueue("jobs", format!(r#"{{"id":{id},"type":"job"}}"#).into_bytes());
        }

        let (jobs_tx, jobs_rx) = bus::rendezvous();
        let sessions = SessionFactory::new(broker.connector(), DialPolicy::default())
            .spawn(cancel.child_token());
        let subscriber = tokio::spawn(QueuedSubscriber::new("jobs").run(sessions, jobs_tx));
        let dispatching = tokio::spawn(dispatcher.run(jobs_rx));

        let store = repo.clone();
        assert!(
            broker
                .wait_until(WAIT, move |_| {
                    store
                        .get_job(31)
                        .is_some_and(|j| j.status == JobStatus::Processing)
                })
                .await
        );
        cancel.cancel();

        tokio::time::timeout(WAIT, dispatching).await.unwrap().unwrap();
        tokio::time::timeout(WAIT, subscriber).await.unwrap().unwrap().unwrap();

        // job 32 was delivered but never taken, so it is back in the queue
        assert_eq!(broker.acked(), vec![br#"{"id":31,"type":"job"}"#.to_vec()]);
        assert!(broker.wait_until(WAIT, |b| b.queue_len("jobs") == 1).await);
        assert_eq!(repo.get_job(31).unwrap().status, JobStatus::Completed);
        assert_eq!(repo.get_job(32).unwrap().status, JobStatus::Pending);
        assert_eq!(
            drain_statuses(&mut statuses),
            vec![
                ("job".to_string(), 31, JobStatus::Processing),
                ("job".to_string(), 31, JobStatus::Completed),
            ]
        );
    }
}
