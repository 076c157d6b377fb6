use itertools::Itertools;
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_stream::wrappers::IntervalStream;
use tracing::debug;

/// Ticks every `duration`, the first tick one full period from now.
pub(crate) fn create_interval_stream(duration: std::time::Duration) -> IntervalStream {
    let interval = tokio::time::interval_at(Instant::now() + duration, duration);
    IntervalStream::new(interval)
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Failed running {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    pub fn stderr(&self) -> &str {
        match self {
            Self::Spawn { .. } => "",
            Self::Failed { stderr, .. } => stderr,
        }
    }
}

/// Runs an external tool to completion and returns its stdout.
pub(crate) async fn run_command<I, S>(
    program: &str,
    args: I,
    stdin: Option<&str>,
) -> Result<String, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    let command = format!(
        "{program} {}",
        args.iter().map(|a| a.to_string_lossy()).join(" ")
    );
    debug!(%command, "running");

    let spawn_err = |source| CommandError::Spawn {
        program: program.to_owned(),
        source,
    };

    let mut child = Command::new(program)
        .args(&args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(spawn_err)?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await.map_err(spawn_err)?;
    }

    let output = child.wait_with_output().await.map_err(spawn_err)?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(CommandError::Failed {
            command,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}
