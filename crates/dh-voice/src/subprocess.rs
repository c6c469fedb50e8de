//! Running local inference binaries with bounded input and time.

use crate::error::VoiceError;
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Spawns `command`, feeds `stdin` to it, and returns its stdout.
///
/// Stdin is written from a separate task so a child that fills its stdout
/// pipe before draining stdin cannot deadlock us. The child is killed if it
/// outlives `timeout`.
pub(crate) async fn run_with_stdin(
    mut command: Command,
    stdin: Vec<u8>,
    timeout: Duration,
) -> Result<Vec<u8>, VoiceError> {
    let program = program_name(command.as_std().get_program());
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| VoiceError::Spawn {
        program: program.clone(),
        source,
    })?;

    let mut child_stdin = child.stdin.take().ok_or_else(|| VoiceError::ProcessFailed {
        program: program.clone(),
        stderr: "failed to open stdin".to_string(),
    })?;
    let write_task = tokio::spawn(async move {
        child_stdin.write_all(&stdin).await?;
        child_stdin.shutdown().await
    });

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| VoiceError::Timeout {
            program: program.clone(),
            timeout,
        })??;

    if !output.status.success() {
        return Err(VoiceError::ProcessFailed {
            program,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    match write_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(VoiceError::ProcessFailed {
                program,
                stderr: format!("failed to write stdin: {e}"),
            })
        }
        Err(e) => {
            return Err(VoiceError::ProcessFailed {
                program,
                stderr: format!("stdin task failed: {e}"),
            })
        }
    }

    Ok(output.stdout)
}

fn program_name(program: &OsStr) -> String {
    std::path::Path::new(program)
        .file_name()
        .unwrap_or(program)
        .to_string_lossy()
        .into_owned()
}
