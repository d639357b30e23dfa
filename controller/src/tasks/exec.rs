//! Process execution for the tool-backed stage adapters

use crate::tasks::stages::StageResult;
use async_trait::async_trait;
use chrono::Utc;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A single tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Check a user-supplied value that is passed as a positional argument;
/// `what` names the field in the error
pub fn positional<'a>(what: &str, value: &'a str) -> anyhow::Result<&'a str> {
    if value.starts_with('-') {
        return Err(anyhow::anyhow!("{what} '{value}' must not start with '-'"));
    }
    Ok(value)
}

/// Runs commands and captures their output as a stage result
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: CommandSpec) -> StageResult;
}

/// Runs commands as child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cmd: CommandSpec) -> StageResult {
        let started_at = Utc::now();
        debug!(program = %cmd.program, args = ?cmd.args, "Running command");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &cmd.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %cmd.program, error = %e, "Failed to start command");
                return StageResult::failure(started_at, format!("Starting {}: {e}", cmd.program));
            }
        };

        // Feed stdin while stdout and stderr drain so neither pipe can fill up.
        let writer = match (cmd.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                let written = stdin.write_all(input.as_bytes()).await;
                drop(stdin);
                match written {
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                    other => other,
                }
            })),
            _ => None,
        };
        let abort_writer = writer.as_ref().map(JoinHandle::abort_handle);

        let exchange = async move {
            let output = child.wait_with_output().await;
            let written = match writer {
                Some(handle) => handle.await.map_err(io::Error::other).and_then(|r| r),
                None => Ok(()),
            };
            (output, written)
        };

        let (output, written) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(exchanged) => exchanged,
                Err(_) => {
                    if let Some(handle) = abort_writer {
                        handle.abort();
                    }
                    return StageResult::failure(
                        started_at,
                        format!("{} timed out after {}s", cmd.program, limit.as_secs()),
                    );
                }
            },
            None => exchange.await,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return StageResult::failure(started_at, format!("Waiting for {}: {e}", cmd.program));
            }
        };
        if let Err(e) = written {
            return StageResult::failure(started_at, format!("Writing stdin of {}: {e}", cmd.program));
        }

        let exit_code = output.status.code().unwrap_or(1);
        StageResult {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error: (exit_code != 0).then(|| format!("{} exited with code {exit_code}", cmd.program)),
            started_at,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = ProcessRunner::default();
        let result = runner
            .run(CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]))
            .await;
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let runner = ProcessRunner::default();
        let result = runner.run(CommandSpec::new("cat").stdin("kind: ConfigMap\n")).await;
        assert!(result.is_success());
        assert_eq!(result.stdout, "kind: ConfigMap\n");
    }

    #[tokio::test]
    async fn missing_binary_is_a_failed_result() {
        let runner = ProcessRunner::default();
        let result = runner.run(CommandSpec::new("definitely-not-a-real-binary-xyz")).await;
        assert_eq!(result.exit_code, 1);
        assert!(result.failure_message().contains("definitely-not-a-real-binary-xyz"));
    }

    #[tokio::test]
    async fn timeout_kills_long_running_command() {
        let runner = ProcessRunner::new(Some(Duration::from_millis(200)));
        let result = runner.run(CommandSpec::new("sleep").arg("5")).await;
        assert!(!result.is_success());
        assert!(result.failure_message().contains("timed out"));
    }

    #[test]
    fn flag_like_positionals_are_rejected() {
        assert_eq!(positional("git ref", "origin/main").unwrap(), "origin/main");
        let err = positional("git ref", "--upload-pack=touch /tmp/x").unwrap_err();
        assert!(err.to_string().contains("git ref '--upload-pack=touch /tmp/x'"));
    }

    #[tokio::test]
    async fn large_stdin_and_stdout_flow_concurrently() {
        let runner = ProcessRunner::new(Some(Duration::from_secs(5)));
        let input = "x".repeat(256 * 1024);
        let result = runner
            .run(
                CommandSpec::new("sh")
                    .args(["-c", "head -c 262144 /dev/zero; cat >/dev/null"])
                    .stdin(input),
            )
            .await;
        assert!(result.is_success(), "{}", result.failure_message());
        assert_eq!(result.stdout.len(), 262_144);
    }

    #[tokio::test]
    async fn echoes_large_stdin() {
        let runner = ProcessRunner::new(Some(Duration::from_secs(5)));
        let input = "kind: ConfigMap\n".repeat(32 * 1024);
        let result = runner.run(CommandSpec::new("cat").stdin(input.clone())).await;
        assert!(result.is_success());
        assert_eq!(result.stdout, input);
    }

    #[tokio::test]
    async fn timeout_covers_a_child_that_never_reads_stdin() {
        let runner = ProcessRunner::new(Some(Duration::from_millis(300)));
        let result = runner
            .run(CommandSpec::new("sleep").arg("5").stdin("y".repeat(1024 * 1024)))
            .await;
        assert!(!result.is_success());
        assert!(result.failure_message().contains("timed out"));
    }

    #[tokio::test]
    async fn child_exiting_without_reading_stdin_is_not_a_write_error() {
        let runner = ProcessRunner::new(Some(Duration::from_secs(5)));
        let result = runner
            .run(CommandSpec::new("true").stdin("z".repeat(1024 * 1024)))
            .await;
        assert!(result.is_success(), "{}", result.failure_message());
    }
}
