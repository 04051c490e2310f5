//! Verification runner (spec §4.6, §4.6.1).
//!
//! Generalizes the teacher's `verifier::pipeline::run_with_timeout` —
//! argv-only `Command` execution, `kill_on_drop`, a detached process group,
//! and a wall-clock `tokio::time::timeout` — from a fixed cargo-gate
//! command set to the caller-supplied, allow-list-checked commands a
//! feature's `VerificationConfig` names.

use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::security;

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const TRUNCATED_HEAD_BYTES: usize = 512 * 1024;
const TRUNCATED_TAIL_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone, Serialize, schemars::JsonSchema)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: Option<i32>,
    pub passed: bool,
    pub output: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, schemars::JsonSchema)]
pub struct VerificationReport {
    pub passed: bool,
    pub results: Vec<CommandResult>,
}

/// Runs every command in `commands` against `cwd` in order, stopping early
/// only if `fail_on_error` is set and a command fails. Each command must
/// already be on the allow-list (spec §4.6.1) — commands are re-validated
/// here rather than trusting a prior check, since this is the last line of
/// defense before a subprocess spawns.
pub async fn run_verification(
    cwd: &std::path::Path,
    commands: &[String],
    fail_on_error: bool,
    timeout_secs: Option<u64>,
) -> OrchestratorResult<VerificationReport> {
    let timeout = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
    let mut results = Vec::with_capacity(commands.len());
    let mut overall_passed = true;

    for command in commands {
        let result = run_one(cwd, command, timeout).await?;
        if !result.passed {
            overall_passed = false;
        }
        let should_stop = fail_on_error && !result.passed;
        results.push(result);
        if should_stop {
            break;
        }
    }

    Ok(VerificationReport {
        passed: overall_passed,
        results,
    })
}

async fn run_one(cwd: &std::path::Path, command: &str, timeout: Duration) -> OrchestratorResult<CommandResult> {
    let argv = security::validate_allowed_command(command)?;
    let started = tokio::time::Instant::now();

    let mut cmd = tokio::process::Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| OrchestratorError::filesystem(argv[0].clone(), e.to_string()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let output_fut = async move {
        let out = match stdout {
            Some(mut s) => {
                let mut buf = Vec::new();
                let _ = tokio::io::AsyncReadExt::read_to_end(&mut s, &mut buf).await;
                buf
            }
            None => Vec::new(),
        };
        let err = match stderr {
            Some(mut s) => {
                let mut buf = Vec::new();
                let _ = tokio::io::AsyncReadExt::read_to_end(&mut s, &mut buf).await;
                buf
            }
            None => Vec::new(),
        };
        (out, err)
    };

    let wait_result = tokio::time::timeout(timeout, async {
        let (out, err) = output_fut.await;
        let status = child.wait().await;
        (status, out, err)
    })
    .await;

    let duration_ms = started.elapsed().as_millis() as u64;

    match wait_result {
        Ok((status, stdout_bytes, stderr_bytes)) => {
            let exit_code = status.ok().and_then(|s| s.code());
            let combined = combine_output(&stdout_bytes, &stderr_bytes);
            Ok(CommandResult {
                command: command.to_string(),
                exit_code,
                passed: exit_code == Some(0),
                output: combined,
                timed_out: false,
                duration_ms,
            })
        }
        Err(_elapsed) => {
            // tokio drops the Child on timeout; kill_on_drop(true) ensures
            // the process (and its group, on unix) is reaped.
            Ok(CommandResult {
                command: command.to_string(),
                exit_code: None,
                passed: false,
                output: format!("command timed out after {}s", timeout.as_secs()),
                timed_out: true,
                duration_ms,
            })
        }
    }
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = Vec::with_capacity(stdout.len() + stderr.len());
    combined.extend_from_slice(stdout);
    if !stderr.is_empty() {
        combined.extend_from_slice(b"\n--- stderr ---\n");
        combined.extend_from_slice(stderr);
    }
    let text = String::from_utf8_lossy(&combined).to_string();
    let truncated = truncate_head_tail(&text, MAX_OUTPUT_BYTES);
    security::sanitize_output(&truncated, MAX_OUTPUT_BYTES)
}

/// Keeps the first and last slices of oversized output rather than just the
/// tail — failures are as often explained at the top of a log as the
/// bottom. Truncation points are rounded to a char boundary since the
/// requested byte offsets can otherwise land inside a multibyte codepoint.
fn truncate_head_tail(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let head_end = security::floor_char_boundary(s, TRUNCATED_HEAD_BYTES.min(s.len()));
    let head = &s[..head_end];
    let tail_start = security::ceil_char_boundary(s, s.len().saturating_sub(TRUNCATED_TAIL_BYTES));
    let tail = &s[tail_start..];
    format!("{head}\n...[{} bytes omitted]...\n{tail}", tail_start - head_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_command_not_on_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_verification(dir.path(), &["rm -rf /".to_string()], true, None).await;
        assert!(report.is_err());
    }

    #[tokio::test]
    async fn runs_allowed_git_status_command() {
        let dir = tempfile::tempdir().unwrap();
        std::process::Command::new("git")
            .args(["init"])
            .current_dir(dir.path())
            .output()
            .ok();
        let report = run_verification(dir.path(), &["git status".to_string()], true, Some(30))
            .await
            .unwrap();
        assert_eq!(report.results.len(), 1);
    }

    #[test]
    fn truncate_head_tail_keeps_both_ends() {
        let s = "a".repeat(2_000_000);
        let truncated = truncate_head_tail(&s, MAX_OUTPUT_BYTES);
        assert!(truncated.len() < s.len());
        assert!(truncated.starts_with('a'));
        assert!(truncated.ends_with('a'));
    }

    #[test]
    fn truncate_head_tail_does_not_panic_on_multibyte_boundary() {
        // A leading single-byte char shifts every subsequent 2-byte "é" off
        // an even offset, so a naive cut at TRUNCATED_HEAD_BYTES or
        // s.len() - TRUNCATED_TAIL_BYTES lands mid-codepoint here.
        let s = format!("a{}", "é".repeat(2_000_000));
        let truncated = truncate_head_tail(&s, MAX_OUTPUT_BYTES);
        assert!(truncated.len() < s.len());
        assert!(truncated.is_char_boundary(0));
    }
}
