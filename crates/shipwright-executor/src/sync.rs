//! Repository synchronisation.
//!
//! Brings a project's checkout to the tip of its remote branch. A missing
//! checkout is cloned; an existing one is opened and fetched. Either way the
//! working tree is then hard-reset to `origin/<branch>`. Each step writes a
//! line to the job log before it starts and reports its outcome after.

use shipwright_core::Project;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::git::{FetchOutcome, GitBackend};
use crate::sink::SharedSink;
use crate::storage::StorageLayout;
use crate::{ExecutorError, ExecutorErrorKind, ExecutorResult};

/// Synchronises project checkouts below a [`StorageLayout`]
#[derive(Debug, Clone)]
pub struct RepositorySync<G> {
    git: G,
    layout: StorageLayout,
}

impl<G: GitBackend> RepositorySync<G> {
    /// Creates a synchroniser
    pub fn new(git: G, layout: StorageLayout) -> Self {
        Self { git, layout }
    }

    /// Storage layout the checkouts live in
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Synchronises `project` and returns the checkout path
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorErrorKind::SshKeyRequired`] for an SSH project
    /// without a key, before touching the network, and the failing step's
    /// error otherwise.
    pub async fn synchronize(&self, project: &Project, log: SharedSink) -> ExecutorResult<PathBuf> {
        let result = self.run(project, log.clone()).await;
        if let Err(err) = &result {
            warn!(project_id = project.id, error = %err, "repository synchronisation failed");
        }
        result
    }

    async fn run(&self, project: &Project, log: SharedSink) -> ExecutorResult<PathBuf> {
        if project.missing_ssh_key() {
            let err = ExecutorError::from(ExecutorErrorKind::SshKeyRequired);
            log.line(err.to_string()).await;
            return Err(err);
        }

        let env = self.git_env(project).await;
        let env = match env {
            Ok(env) => env,
            Err(err) => {
                log.line(format!("Cannot write key: {err}")).await;
                return Err(err);
            }
        };

        let path = self.layout.repository(project.id);
        if tokio::fs::try_exists(&path).await? {
            log.line("git open".to_string()).await;
            report(&log, "git open", self.git.open(&path).await, |_| "done".to_string()).await?;

            log.line(format!("git fetch {}", project.repo_url)).await;
            let fetched = self.git.fetch(&path, &env, log.clone()).await;
            report(&log, "git fetch", fetched, |outcome| match outcome {
                FetchOutcome::Updated => "done".to_string(),
                FetchOutcome::UpToDate => "already up to date".to_string(),
            })
            .await?;
        } else {
            log.line(format!("git clone {}", project.repo_url)).await;
            let cloned = self
                .git
                .clone_repo(&project.repo_url, &path, &env, log.clone())
                .await;
            report(&log, "git clone", cloned, |_| "done".to_string()).await?;
        }

        let revision = format!("origin/{}", project.repo_branch);
        log.line(format!("git rev-parse {revision}")).await;
        let resolved = self.git.resolve(&path, &revision).await;
        let commit = report(&log, "git rev-parse", resolved, String::clone).await?;

        log.line(format!("git reset --hard {commit}")).await;
        if let Err(err) = self.git.reset_hard(&path, &commit).await {
            log.line(err.to_string()).await;
            return Err(err);
        }
        log.line("Repository up to date".to_string()).await;
        debug!(project_id = project.id, %commit, "repository synchronised");
        Ok(path)
    }

    async fn git_env(&self, project: &Project) -> ExecutorResult<Vec<(String, String)>> {
        let mut env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
        if project.is_http() {
            return Ok(env);
        }
        if let Some(key) = &project.ssh_key {
            let key_path = self.layout.write_key(key).await?;
            let mut command = vec![
                "ssh".to_string(),
                "-i".to_string(),
                key_path.to_string_lossy().into_owned(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ];
            if !project.repo_user.is_empty() {
                command.push("-l".to_string());
                command.push(project.repo_user.clone());
            }
            env.push(("GIT_SSH_COMMAND".to_string(), shell_words::join(command)));
        }
        Ok(env)
    }
}

async fn report<T>(
    log: &SharedSink,
    step: &str,
    result: ExecutorResult<T>,
    describe: impl FnOnce(&T) -> String,
) -> ExecutorResult<T> {
    match &result {
        Ok(value) => log.line(format!("{step}: {}", describe(value))).await,
        Err(err) => log.line(err.to_string()).await,
    }
    result
}
