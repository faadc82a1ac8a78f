//! External command execution.
//!
//! Every system interaction (ping, nmcli, ip, speedtest, node, curl) is a
//! black-box command with a status + stdout + stderr contract. Components are
//! generic over [`CommandRunner`] so tests can substitute scripted output.

use std::future::Future;
use std::process::Stdio;

use thiserror::Error;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Exit code, or -1 when the process did not exit normally.
    pub fn code(&self) -> i32 {
        self.status.unwrap_or(-1)
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs external programs to completion.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and wait for it to exit.
    fn run(
        &self,
        program: &str,
        args: &[&str],
    ) -> impl Future<Output = Result<CommandOutput, CommandError>> + Send;

    /// Whether `program` can be found on the search path.
    fn is_available(&self, program: &str) -> bool;
}

/// Run a command and report only whether it exited with status 0.
///
/// Spawn failures count as failure.
pub async fn succeeded<R: CommandRunner>(runner: &R, program: &str, args: &[&str]) -> bool {
    match runner.run(program, args).await {
        Ok(out) => out.success(),
        Err(e) => {
            tracing::debug!(error = %e, "command could not be started");
            false
        }
    }
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        tracing::debug!(program, ?args, "running command");
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            // An interrupted cycle must not leave half-finished tools behind.
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let out = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::trace!(program, status = ?out.status, "command finished");
        Ok(out)
    }

    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_defaults_when_signalled() {
        let out = CommandOutput {
            status: None,
            ..Default::default()
        };
        assert!(!out.success());
        assert_eq!(out.code(), -1);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = SystemRunner
            .run("netwarden-definitely-not-a-real-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
        assert!(!succeeded(&SystemRunner, "netwarden-definitely-not-a-real-binary", &[]).await);
    }
}
