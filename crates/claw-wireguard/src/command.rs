//! External command execution.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, WireGuardError};

/// Runs `program` with `args`, feeding `stdin` lines, and returns stdout.
///
/// The child is killed if it does not finish within `timeout`.
pub async fn run(
    program: &str,
    args: &[&str],
    stdin: &[String],
    timeout: Duration,
) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_empty() { Stdio::null() } else { Stdio::piped() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| WireGuardError::Command {
            program: program.to_string(),
            message: e.to_string(),
        })?;

    if let Some(mut pipe) = child.stdin.take() {
        let mut input = stdin.join("\n");
        input.push('\n');
        pipe.write_all(input.as_bytes()).await?;
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| WireGuardError::Command {
            program: program.to_string(),
            message: format!("timed out after {timeout:?}"),
        })??;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WireGuardError::Command {
            program: program.to_string(),
            message: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    debug!(program, "command finished");
    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run("echo", &["hello"], &[], Duration::from_secs(5))
            .await
            .expect("echo");
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let out = run("cat", &[], &["a".into(), "b".into()], Duration::from_secs(5))
            .await
            .expect("cat");
        assert_eq!(out, "a\nb\n");
    }

    #[tokio::test]
    async fn non_zero_exit_is_error() {
        let err = run("false", &[], &[], Duration::from_secs(5))
            .await
            .expect_err("false fails");
        assert!(matches!(err, WireGuardError::Command { .. }));
    }

    #[tokio::test]
    async fn times_out() {
        let err = run("sleep", &["5"], &[], Duration::from_millis(50))
            .await
            .expect_err("timeout");
        assert!(err.to_string().contains("timed out"));
    }
}
