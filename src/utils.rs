use std::{ffi::OsStr, path::Path, process::Stdio};

use tokio::process::Command;
use tracing::debug;

use crate::error::AppError;

fn display_command(program: &OsStr, args: &[&str]) -> String {
    let program = Path::new(program)
        .file_name()
        .unwrap_or(program)
        .to_string_lossy();
    if args.is_empty() {
        program.into_owned()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

/// Runs a command to completion and returns its combined stdout/stderr.
/// A non-zero exit becomes `CommandFailed` carrying that output.
pub async fn run_captured(program: impl AsRef<OsStr>, args: &[&str]) -> Result<String, AppError> {
    let program = program.as_ref();
    let command = display_command(program, args);
    debug!(cmd = %command, "running command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| AppError::LaunchFailed {
            program: command.clone(),
            source,
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(AppError::command_failed(
            command,
            format!("{}; output: {}", output.status, combined.trim()),
        ));
    }
    Ok(combined)
}

/// Runs a command attached to the caller's terminal so it can prompt
/// interactively, and waits for it to exit.
pub async fn run_interactive(program: impl AsRef<OsStr>, args: &[&str]) -> Result<(), AppError> {
    let program = program.as_ref();
    let command = display_command(program, args);
    debug!(cmd = %command, "running interactive command");

    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|source| AppError::LaunchFailed {
            program: command.clone(),
            source,
        })?;

    if !status.success() {
        return Err(AppError::command_failed(command, status.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let out = run_captured("/bin/sh", &["-c", "echo out; echo err 1>&2"])
            .await
            .unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_output() {
        let err = run_captured("/bin/sh", &["-c", "echo boom; exit 3"])
            .await
            .unwrap_err();
        match err {
            AppError::CommandFailed { command, output } => {
                assert!(command.starts_with("sh -c"));
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_launch_failure() {
        let err = run_captured("/nonexistent/tool-7c1e", &[]).await.unwrap_err();
        assert!(matches!(err, AppError::LaunchFailed { .. }));
    }
}
