//! Child process execution with streamed output.
//!
//! Standard output and standard error are read by two scanner tasks running
//! in parallel, each feeding the same [`LineSink`]. Lines keep their order
//! within a stream; the two streams interleave in whatever order the sink
//! sees them. [`CommandRunner::run`] returns only after both scanners hit
//! end of file and the process exited, so no line arrives after it returns.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::sink::{SharedSink, split_line};
use crate::{ExecutorErrorKind, ExecutorResult};

/// A program invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name or path
    pub program: String,
    /// Arguments, passed as-is
    pub args: Vec<String>,
    /// Working directory; inherited when unset
    pub dir: Option<PathBuf>,
    /// Variables set on top of the inherited environment
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Creates a spec for `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends one argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory
    #[must_use]
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Sets an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-quoted command line, for logs
    #[must_use]
    pub fn command_line(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }
}

/// Runs [`CommandSpec`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRunner;

impl CommandRunner {
    /// Creates a runner
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Runs the command to completion, sending every output line to `sink`
    ///
    /// # Errors
    ///
    /// Returns an error when the process cannot be started or waited on. A
    /// non-zero exit is not an error; inspect the returned status.
    pub async fn run(&self, spec: &CommandSpec, sink: SharedSink) -> ExecutorResult<ExitStatus> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (OsStr::new(k), OsStr::new(v))))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|reason| ExecutorErrorKind::Spawn {
            program: spec.program.clone(),
            reason,
        })?;
        debug!(program = %spec.program, pid = ?child.id(), "process started");

        let scanners: Vec<JoinHandle<usize>> = [
            child.stdout.take().map(|out| scan(out, sink.clone())),
            child.stderr.take().map(|err| scan(err, sink.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut lines = 0;
        for scanner in scanners {
            match scanner.await {
                Ok(count) => lines += count,
                Err(err) => warn!(error = %err, "output scanner failed"),
            }
        }

        let status = child.wait().await?;
        debug!(program = %spec.program, %status, lines, "process exited");
        Ok(status)
    }
}

fn scan<R>(reader: R, sink: SharedSink) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut count = 0;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    sink.line(split_line(&buf)).await;
                    count += 1;
                }
                Err(err) => {
                    warn!(error = %err, "cannot read process output");
                    break;
                }
            }
        }
        count
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;
    use crate::ExecutorError;
    use pretty_assertions::assert_eq;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_streams_stdout_and_stderr() {
        let sink = CollectingSink::new();
        let status = CommandRunner::new()
            .run(&sh("echo one; echo two; echo oops >&2"), sink.clone())
            .await
            .unwrap();

        assert!(status.success());
        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        let stdout: Vec<_> = lines.iter().filter(|l| *l != "oops").cloned().collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert!(lines.contains(&"oops".to_string()));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let sink = CollectingSink::new();
        let status = CommandRunner::new()
            .run(&sh("echo failing; exit 3"), sink.clone())
            .await
            .unwrap();

        assert!(!status.success());
        assert_eq!(status.code(), Some(3));
        assert_eq!(sink.lines(), vec!["failing"]);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let sink = CollectingSink::new();
        let err: ExecutorError = CommandRunner::new()
            .run(&CommandSpec::new("/nonexistent/shipwright-test"), sink.clone())
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ExecutorErrorKind::Spawn { .. }));
        assert!(sink.lines().is_empty());
    }

    #[tokio::test]
    async fn test_working_directory_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CollectingSink::new();
        let spec = sh("pwd; echo \"$SHIPWRIGHT_TEST\"")
            .current_dir(dir.path())
            .env("SHIPWRIGHT_TEST", "set");

        CommandRunner::new().run(&spec, sink.clone()).await.unwrap();

        let lines = sink.lines();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(&lines[0]).canonicalize().unwrap(), expected);
        assert_eq!(lines[1], "set");
    }

    #[tokio::test]
    async fn test_control_characters_preserved() {
        let sink = CollectingSink::new();
        CommandRunner::new()
            .run(&sh("printf '\\033[0;31mred\\033[0m\\tcol\\r\\n'"), sink.clone())
            .await
            .unwrap();

        assert_eq!(sink.lines(), vec!["\x1b[0;31mred\x1b[0m\tcol"]);
    }

    #[test]
    fn test_command_line_is_quoted() {
        let spec = CommandSpec::new("ansible-playbook")
            .args(["-i", "hosts file", "site.yml"]);
        assert_eq!(spec.command_line(), "ansible-playbook -i 'hosts file' site.yml");
    }
}
