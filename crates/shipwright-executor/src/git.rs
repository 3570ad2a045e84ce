//! Git operations used by repository synchronisation.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;

use crate::command::{CommandRunner, CommandSpec};
use crate::sink::SharedSink;
use crate::{ExecutorError, ExecutorErrorKind, ExecutorResult};

/// Environment variables for one git invocation
pub type GitEnv = [(String, String)];

/// Result of a successful fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// New objects were received
    Updated,
    /// The remote had nothing new
    UpToDate,
}

/// Git operations on a working copy
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Clones `url` into `dest`, streaming progress
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        env: &GitEnv,
        progress: SharedSink,
    ) -> ExecutorResult<()>;

    /// Checks that `repo` is a working copy
    async fn open(&self, repo: &Path) -> ExecutorResult<()>;

    /// Fetches `origin`, streaming progress
    async fn fetch(&self, repo: &Path, env: &GitEnv, progress: SharedSink)
    -> ExecutorResult<FetchOutcome>;

    /// Resolves a revision to a commit hash
    async fn resolve(&self, repo: &Path, revision: &str) -> ExecutorResult<String>;

    /// Hard-resets the working tree to `commit`
    async fn reset_hard(&self, repo: &Path, commit: &str) -> ExecutorResult<()>;
}

/// [`GitBackend`] running the `git` executable
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
    runner: CommandRunner,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    /// Creates a backend running `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            runner: CommandRunner::new(),
        }
    }

    async fn streamed(
        &self,
        operation: &'static str,
        spec: CommandSpec,
        progress: SharedSink,
    ) -> ExecutorResult<()> {
        let status = self.runner.run(&spec, progress).await?;
        if !status.success() {
            return Err(ExecutorError::git(operation, status));
        }
        Ok(())
    }

    /// Remote-tracking refs of `origin` with their commits
    async fn remote_refs(&self, repo: &Path) -> ExecutorResult<String> {
        self.captured(
            "for-each-ref",
            repo,
            &[
                "for-each-ref",
                "--format=%(objectname) %(refname)",
                "refs/remotes/origin",
            ],
        )
        .await
    }

    async fn captured(
        &self,
        operation: &'static str,
        repo: &Path,
        args: &[&str],
    ) -> ExecutorResult<String> {
        let output = Command::new(&self.program)
            .arg("-C")
            .arg(repo)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(|reason| ExecutorErrorKind::Spawn {
                program: self.program.clone(),
                reason,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::git(operation, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn spec(&self, repo: Option<&Path>, env: &GitEnv) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program);
        if let Some(repo) = repo {
            spec = spec.arg("-C").arg(repo.to_string_lossy());
        }
        env.iter()
            .fold(spec, |spec, (key, value)| spec.env(key.clone(), value.clone()))
    }
}

#[async_trait]
impl GitBackend for GitCli {
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        env: &GitEnv,
        progress: SharedSink,
    ) -> ExecutorResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let spec = self
            .spec(None, env)
            .args(["clone", "--progress", "--no-checkout", url])
            .arg(dest.to_string_lossy());
        self.streamed("clone", spec, progress).await
    }

    async fn open(&self, repo: &Path) -> ExecutorResult<()> {
        self.captured("open", repo, &["rev-parse", "--git-dir"])
            .await
            .map(|_| ())
    }

    async fn fetch(
        &self,
        repo: &Path,
        env: &GitEnv,
        progress: SharedSink,
    ) -> ExecutorResult<FetchOutcome> {
        let spec = self
            .spec(Some(repo), env)
            .args(["fetch", "--progress", "origin"]);
        let before = self.remote_refs(repo).await?;
        self.streamed("fetch", spec, progress).await?;
        let after = self.remote_refs(repo).await?;
        Ok(if before == after {
            FetchOutcome::UpToDate
        } else {
            FetchOutcome::Updated
        })
    }

    async fn resolve(&self, repo: &Path, revision: &str) -> ExecutorResult<String> {
        let revision = format!("{revision}^{{commit}}");
        self.captured("rev-parse", repo, &["rev-parse", "--verify", &revision])
            .await
    }

    async fn reset_hard(&self, repo: &Path, commit: &str) -> ExecutorResult<()> {
        self.captured("reset", repo, &["reset", "--hard", commit])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<G: GitBackend + ?Sized> GitBackend for Arc<G> {
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        env: &GitEnv,
        progress: SharedSink,
    ) -> ExecutorResult<()> {
        (**self).clone_repo(url, dest, env, progress).await
    }

    async fn open(&self, repo: &Path) -> ExecutorResult<()> {
        (**self).open(repo).await
    }

    async fn fetch(
        &self,
        repo: &Path,
        env: &GitEnv,
        progress: SharedSink,
    ) -> ExecutorResult<FetchOutcome> {
        (**self).fetch(repo, env, progress).await
    }

    async fn resolve(&self, repo: &Path, revision: &str) -> ExecutorResult<String> {
        (**self).resolve(repo, revision).await
    }

    async fn reset_hard(&self, repo: &Path, commit: &str) -> ExecutorResult<()> {
        (**self).reset_hard(repo, commit).await
    }
}

/// [`GitBackend`] recording calls instead of running git
///
/// Clones create the destination directory and report one progress line;
/// every revision resolves to [`RecordingGit::COMMIT`].
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Default)]
pub struct RecordingGit {
    calls: parking_lot::Mutex<Vec<String>>,
    envs: parking_lot::Mutex<Vec<Vec<(String, String)>>>,
    fetch_outcome: Option<FetchOutcome>,
    fail: Option<&'static str>,
}

#[cfg(any(test, feature = "test-support"))]
impl RecordingGit {
    /// Commit every revision resolves to
    pub const COMMIT: &'static str = "0123abcd";

    /// Creates a backend where every operation succeeds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the operation named `operation` fail
    #[must_use]
    pub fn failing(mut self, operation: &'static str) -> Self {
        self.fail = Some(operation);
        self
    }

    /// Sets what fetches report
    #[must_use]
    pub fn with_fetch_outcome(mut self, outcome: FetchOutcome) -> Self {
        self.fetch_outcome = Some(outcome);
        self
    }

    /// Operations performed so far
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Environments passed to clone and fetch
    #[must_use]
    pub fn envs(&self) -> Vec<Vec<(String, String)>> {
        self.envs.lock().clone()
    }

    fn record(&self, call: String, operation: &'static str) -> ExecutorResult<()> {
        self.calls.lock().push(call);
        if self.fail == Some(operation) {
            return Err(ExecutorError::git(operation, "simulated failure"));
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl GitBackend for RecordingGit {
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        env: &GitEnv,
        progress: SharedSink,
    ) -> ExecutorResult<()> {
        self.envs.lock().push(env.to_vec());
        self.record(format!("clone {url}"), "clone")?;
        progress
            .line("Receiving objects: 100% (3/3), done.".to_string())
            .await;
        tokio::fs::create_dir_all(dest).await?;
        Ok(())
    }

    async fn open(&self, _repo: &Path) -> ExecutorResult<()> {
        self.record("open".to_string(), "open")
    }

    async fn fetch(
        &self,
        _repo: &Path,
        env: &GitEnv,
        _progress: SharedSink,
    ) -> ExecutorResult<FetchOutcome> {
        self.envs.lock().push(env.to_vec());
        self.record("fetch".to_string(), "fetch")?;
        Ok(self.fetch_outcome.unwrap_or(FetchOutcome::Updated))
    }

    async fn resolve(&self, _repo: &Path, revision: &str) -> ExecutorResult<String> {
        self.record(format!("resolve {revision}"), "rev-parse")?;
        Ok(Self::COMMIT.to_string())
    }

    async fn reset_hard(&self, _repo: &Path, commit: &str) -> ExecutorResult<()> {
        self.record(format!("reset {commit}"), "reset")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=Shipwright", "-c", "user.email=ci@example.com"])
            .args(args)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Bare `remote.git` with one commit on `main`, pushed from `work`
    fn remote_with_commit(root: &Path) -> (PathBuf, PathBuf) {
        let remote = root.join("remote.git");
        let work = root.join("work");
        git(root, &["init", "-q", "--bare", &remote.to_string_lossy()]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(root, &["init", "-q", &work.to_string_lossy()]);
        git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&work, &["remote", "add", "origin", &remote.to_string_lossy()]);
        commit_and_push(&work, "v1");
        (remote, work)
    }

    fn commit_and_push(work: &Path, contents: &str) {
        std::fs::write(work.join("site.yml"), contents).unwrap();
        git(work, &["add", "site.yml"]);
        git(work, &["commit", "-q", "-m", contents]);
        git(work, &["push", "-q", "origin", "main"]);
    }

    #[test]
    fn test_spec_carries_env_and_repo() {
        let git = GitCli::default();
        let env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
        let spec = git
            .spec(Some(Path::new("/srv/repo")), &env)
            .args(["fetch", "origin"]);

        assert_eq!(spec.command_line(), "git -C /srv/repo fetch origin");
        assert_eq!(spec.env, env);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let git = GitCli::new("/nonexistent/git");
        let dir = tempfile::tempdir().unwrap();
        let err = git.open(dir.path()).await.unwrap_err();
        assert!(matches!(err.kind(), ExecutorErrorKind::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_failed_command_is_git_error() {
        let git = GitCli::new("/bin/false");
        let dir = tempfile::tempdir().unwrap();
        let sink = CollectingSink::new();
        let err = git
            .fetch(dir.path(), &[], sink.clone())
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ExecutorErrorKind::Git { operation: "for-each-ref", .. }));
    }

    #[tokio::test]
    async fn test_clone_fetch_and_reset_against_bare_remote() {
        let root = tempfile::tempdir().unwrap();
        let (remote, work) = remote_with_commit(root.path());
        let checkout = root.path().join("repositories/1");
        let git_cli = GitCli::default();
        let sink = CollectingSink::new();

        git_cli
            .clone_repo(&remote.to_string_lossy(), &checkout, &[], sink.clone())
            .await
            .unwrap();
        git_cli.open(&checkout).await.unwrap();
        assert_eq!(
            git_cli.fetch(&checkout, &[], sink.clone()).await.unwrap(),
            FetchOutcome::UpToDate
        );

        commit_and_push(&work, "v2");
        assert_eq!(
            git_cli.fetch(&checkout, &[], sink.clone()).await.unwrap(),
            FetchOutcome::Updated
        );
        assert_eq!(
            git_cli.fetch(&checkout, &[], sink.clone()).await.unwrap(),
            FetchOutcome::UpToDate
        );

        let commit = git_cli.resolve(&checkout, "origin/main").await.unwrap();
        assert_eq!(commit, git(&work, &["rev-parse", "HEAD"]));
        git_cli.reset_hard(&checkout, &commit).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(checkout.join("site.yml")).unwrap(),
            "v2"
        );
    }

    #[tokio::test]
    async fn test_unknown_revision_is_git_error() {
        let root = tempfile::tempdir().unwrap();
        let (remote, _work) = remote_with_commit(root.path());
        let checkout = root.path().join("checkout");
        let git_cli = GitCli::default();

        git_cli
            .clone_repo(&remote.to_string_lossy(), &checkout, &[], CollectingSink::new())
            .await
            .unwrap();
        let err = git_cli
            .resolve(&checkout, "origin/release")
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ExecutorErrorKind::Git { operation: "rev-parse", .. }));
    }
}
