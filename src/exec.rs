//! External command execution with streaming output and cancellation.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Error type for command execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The attempt's cancellation token fired while the command ran.
    #[error("command cancelled")]
    Cancelled,

    /// Empty argv.
    #[error("empty command")]
    EmptyCommand,

    /// The command could not be spawned.
    #[error("spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure while streaming output or waiting for the child.
    #[error("command io: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability to run a child process to completion.
///
/// Stdout and stderr are streamed into the provided sinks as the child
/// produces them; nothing buffers the full output in memory. The returned
/// value is the child's exit code (`-1` when killed by a signal); non-zero
/// exits are not an error here; callers decide what they mean.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        argv: &[String],
        env: &[(String, String)],
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i32, ExecError>;
}

/// Real command runner over `tokio::process`.
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        argv: &[String],
        env: &[(String, String)],
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i32, ExecError> {
        let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            command: program.clone(),
            source,
        })?;

        let mut child_out = child.stdout.take().expect("stdout piped");
        let mut child_err = child.stderr.take().expect("stderr piped");

        // Drain both pipes concurrently; a full pipe must never stall the
        // child while we wait on the other one.
        let copies = async {
            let _ = tokio::join!(
                tokio::io::copy(&mut child_out, stdout),
                tokio::io::copy(&mut child_err, stderr),
            );
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(ExecError::Cancelled)
            }
            _ = copies => {
                let status = child.wait().await?;
                Ok(status.code().unwrap_or(-1))
            }
        }
    }
}
