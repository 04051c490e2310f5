//! Worker lifecycle manager (spec §4.3) and the terminal-multiplexer
//! adapter that fills the grounding gap noted in SPEC_FULL.md §4.3.1: the
//! teacher's harness never spawns a subprocess per feature, so the
//! argv-only, timeout-bounded process-execution discipline of
//! `verifier::pipeline::run_with_timeout` is generalized here from bounded
//! cargo-gate execution to long-running detached tmux sessions.

use std::path::PathBuf;
use std::process::Stdio;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{Session, WorkerRunState, WorkerStatus};
use crate::security;

/// Controls an OS-level detached terminal-multiplexer session. The
/// orchestrator never interacts with a session except via these named
/// subcommands (spec GLOSSARY).
pub trait SessionMultiplexer: Send + Sync {
    fn new_session(
        &self,
        session_name: &str,
        cwd: &std::path::Path,
        argv: &[String],
    ) -> OrchestratorResult<()>;
    fn has_session(&self, session_name: &str) -> bool;
    fn kill_session(&self, session_name: &str) -> OrchestratorResult<()>;
}

/// Shells out to a real `tmux` binary using argv form exclusively — never a
/// shell string. Every argument is either a validated session name, a
/// validated project directory, or a fixed flag.
pub struct TmuxMultiplexer {
    pub tmux_bin: String,
}

impl Default for TmuxMultiplexer {
    fn default() -> Self {
        Self {
            tmux_bin: "tmux".to_string(),
        }
    }
}

impl SessionMultiplexer for TmuxMultiplexer {
    fn new_session(
        &self,
        session_name: &str,
        cwd: &std::path::Path,
        argv: &[String],
    ) -> OrchestratorResult<()> {
        security::validate_session_name(session_name)?;
        let mut cmd = std::process::Command::new(&self.tmux_bin);
        cmd.args(["new-session", "-d", "-s", session_name, "-c"])
            .arg(cwd)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = cmd
            .status()
            .map_err(|e| OrchestratorError::filesystem(self.tmux_bin.clone(), e.to_string()))?;
        if !status.success() {
            return Err(OrchestratorError::SubprocessFailed {
                command: format!("{} new-session -s {session_name}", self.tmux_bin),
                exit_code: status.code(),
            });
        }
        Ok(())
    }

    fn has_session(&self, session_name: &str) -> bool {
        std::process::Command::new(&self.tmux_bin)
            .args(["has-session", "-t", session_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn kill_session(&self, session_name: &str) -> OrchestratorResult<()> {
        let status = std::process::Command::new(&self.tmux_bin)
            .args(["kill-session", "-t", session_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        // Killing an already-dead session is not an error: best-effort per spec §4.3.
        let _ = status;
        Ok(())
    }
}

/// In-memory stand-in for tests — never depends on a real `tmux` binary.
#[derive(Default)]
pub struct FakeMultiplexer {
    pub live_sessions: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl SessionMultiplexer for FakeMultiplexer {
    fn new_session(
        &self,
        session_name: &str,
        _cwd: &std::path::Path,
        _argv: &[String],
    ) -> OrchestratorResult<()> {
        self.live_sessions
            .lock()
            .unwrap()
            .insert(session_name.to_string());
        Ok(())
    }

    fn has_session(&self, session_name: &str) -> bool {
        self.live_sessions.lock().unwrap().contains(session_name)
    }

    fn kill_session(&self, session_name: &str) -> OrchestratorResult<()> {
        self.live_sessions.lock().unwrap().remove(session_name);
        Ok(())
    }
}

const MAX_LOG_TAIL_BYTES: usize = 64 * 1024;
const HEARTBEAT_SCAN_BYTES: usize = 8 * 1024;

/// Compact summary produced by `check_worker(heartbeat=true)`.
#[derive(Debug, Clone, serde::Serialize, schemars::JsonSchema)]
pub struct HeartbeatSummary {
    pub status: WorkerRunState,
    pub last_tool_used: Option<String>,
    pub last_file: Option<String>,
    pub last_activity: Option<String>,
    pub running_for_secs: i64,
}

pub struct WorkerManager<M: SessionMultiplexer> {
    workers_dir: PathBuf,
    agent_bin: String,
    multiplexer: M,
}

impl<M: SessionMultiplexer> WorkerManager<M> {
    pub fn new(workers_dir: PathBuf, agent_bin: impl Into<String>, multiplexer: M) -> Self {
        Self {
            workers_dir,
            agent_bin: agent_bin.into(),
            multiplexer,
        }
    }

    fn prompt_path(&self, session_name: &str) -> PathBuf {
        self.workers_dir.join(format!("{session_name}.prompt"))
    }
    fn log_path(&self, session_name: &str) -> PathBuf {
        self.workers_dir.join(format!("{session_name}.log"))
    }
    fn done_path(&self, session_name: &str) -> PathBuf {
        self.workers_dir.join(format!("{session_name}.done"))
    }
    fn status_path(&self, session_name: &str) -> PathBuf {
        self.workers_dir.join(format!("{session_name}.status"))
    }
    fn inbox_path(&self, session_name: &str) -> PathBuf {
        self.workers_dir.join(format!("{session_name}.inbox"))
    }

    pub fn has_done_marker(&self, session_name: &str) -> bool {
        self.done_path(session_name).exists()
    }

    /// Generates `cc-worker-<feature_id>-<random 8-12 alnum>`, retrying on
    /// collision against the sessions already recorded in `session`. Feature
    /// ids are validated up to 64 chars, but `sessionName` itself is bounded
    /// to the same 64-char limit, so the `feature_id` fragment is truncated
    /// to leave room for the fixed `cc-worker-`/`-`/token overhead.
    fn generate_session_name(&self, feature_id: &str, session: &Session) -> String {
        const PREFIX: &str = "cc-worker-";
        const MAX_TOKEN_LEN: usize = 12;
        let budget = 64usize.saturating_sub(PREFIX.len() + 1 + MAX_TOKEN_LEN);
        let truncated_id: String = feature_id.chars().take(budget).collect();
        loop {
            let len = rand::thread_rng().gen_range(8..=12);
            let token: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect();
            let candidate = format!("{PREFIX}{truncated_id}-{token}");
            if session.find_worker(&candidate).is_none() {
                return candidate;
            }
        }
    }

    /// Validates, generates a session name, writes the `0600` prompt file,
    /// launches the detached session, and records a `running` WorkerStatus.
    /// Does not itself run admission checks (spec §4.5) — callers run
    /// `scheduler::check_admission` first and hold the session mutex for
    /// the whole transaction.
    pub fn start_worker(
        &self,
        session: &mut Session,
        feature_id: &str,
        prompt_text: &str,
    ) -> OrchestratorResult<String> {
        security::validate_feature_id(feature_id)?;
        let session_name = self.generate_session_name(feature_id, session);
        security::validate_session_name(&session_name)?;

        std::fs::create_dir_all(&self.workers_dir)
            .map_err(|e| OrchestratorError::filesystem(self.workers_dir.display().to_string(), e.to_string()))?;

        let prompt_path = self.prompt_path(&session_name);
        write_mode_0600(&prompt_path, prompt_text.as_bytes())?;

        if self.agent_bin.is_empty() {
            return Err(OrchestratorError::invalid_input(
                "ORCHESTRATOR_AGENT_BIN is not configured; cannot start a worker",
            ));
        }

        let project_dir = session.project_dir.clone();
        let argv = vec![
            self.agent_bin.clone(),
            "--prompt-file".to_string(),
            prompt_path.display().to_string(),
            "--workdir".to_string(),
            project_dir.clone(),
        ];
        self.multiplexer
            .new_session(&session_name, std::path::Path::new(&project_dir), &argv)?;

        let now = Utc::now();
        // At most one WorkerStatus may exist per feature (spec §8 invariant); a
        // retry leaves the previous attempt's entry behind otherwise.
        session.workers.retain(|w| w.feature_id != feature_id);
        session.workers.push(WorkerStatus {
            session_name: session_name.clone(),
            feature_id: feature_id.to_string(),
            started_at: now,
            last_checked: now,
            status: WorkerRunState::Running,
        });

        let feature = session
            .find_feature_mut(feature_id)
            .ok_or_else(|| OrchestratorError::UnknownFeature {
                feature_id: feature_id.to_string(),
            })?;
        feature.status = crate::model::FeatureStatus::InProgress;
        feature.worker_id = Some(session_name.clone());
        feature.attempts += 1;
        feature.started_at = Some(now);

        Ok(session_name)
    }

    /// Writes to the worker's inbox file via temp-file + rename. The
    /// orchestrator does not block on acknowledgement.
    pub fn send_worker_message(&self, session_name: &str, text: &str) -> OrchestratorResult<()> {
        security::validate_session_name(session_name)?;
        let sanitized = security::sanitize_output(text, 16 * 1024);
        let inbox = self.inbox_path(session_name);
        let mut tmp = inbox.clone().into_os_string();
        tmp.push(".tmp");
        let tmp_path = PathBuf::from(tmp);
        std::fs::write(&tmp_path, sanitized.as_bytes())
            .map_err(|e| OrchestratorError::filesystem(inbox.display().to_string(), e.to_string()))?;
        std::fs::rename(&tmp_path, &inbox)
            .map_err(|e| OrchestratorError::filesystem(inbox.display().to_string(), e.to_string()))?;
        Ok(())
    }

    /// Full-mode output capture: the log tail since `cursor` bytes,
    /// sanitised and capped.
    pub fn check_worker_log(&self, session_name: &str, cursor: u64) -> OrchestratorResult<(String, u64)> {
        let path = self.log_path(session_name);
        if !path.exists() {
            return Ok((String::new(), cursor));
        }
        let bytes = std::fs::read(&path)
            .map_err(|e| OrchestratorError::filesystem(path.display().to_string(), e.to_string()))?;
        let start = (cursor as usize).min(bytes.len());
        let tail_start = if bytes.len() - start > MAX_LOG_TAIL_BYTES {
            bytes.len() - MAX_LOG_TAIL_BYTES
        } else {
            start
        };
        let tail = String::from_utf8_lossy(&bytes[tail_start..]).to_string();
        Ok((security::sanitize_output(&tail, MAX_LOG_TAIL_BYTES), bytes.len() as u64))
    }

    /// Heartbeat-mode output capture: a compact summary scanned from only
    /// the last few kilobytes of the log.
    pub fn check_worker_heartbeat(
        &self,
        session_name: &str,
        worker: &WorkerStatus,
    ) -> OrchestratorResult<HeartbeatSummary> {
        let path = self.log_path(session_name);
        let tail = if path.exists() {
            let bytes = std::fs::read(&path)
                .map_err(|e| OrchestratorError::filesystem(path.display().to_string(), e.to_string()))?;
            let start = bytes.len().saturating_sub(HEARTBEAT_SCAN_BYTES);
            String::from_utf8_lossy(&bytes[start..]).to_string()
        } else {
            String::new()
        };

        let last_tool_used = extract_last_match(&tail, r"tool:(\S+)");
        let last_file = extract_last_match(&tail, r"file:(\S+)");
        let running_for_secs = (Utc::now() - worker.started_at).num_seconds();

        Ok(HeartbeatSummary {
            status: worker.status,
            last_tool_used,
            last_file,
            last_activity: tail.lines().last().map(|s| s.to_string()),
            running_for_secs,
        })
    }

    /// Sends a kill to the multiplexer session and marks it `unknown`.
    pub fn kill_worker(&self, session: &mut Session, session_name: &str) -> OrchestratorResult<()> {
        self.multiplexer.kill_session(session_name)?;
        if let Some(worker) = session
            .workers
            .iter_mut()
            .find(|w| w.session_name == session_name)
        {
            worker.status = WorkerRunState::Unknown;
            worker.last_checked = Utc::now();
        }
        Ok(())
    }

    /// Best-effort kill of every live session — used by `orchestrator_reset`
    /// and process shutdown.
    pub fn kill_all(&self, session: &mut Session) {
        let names: Vec<String> = session.workers.iter().map(|w| w.session_name.clone()).collect();
        for name in names {
            let _ = self.multiplexer.kill_session(&name);
        }
        for worker in session.workers.iter_mut() {
            worker.status = WorkerRunState::Unknown;
        }
    }

    pub fn has_live_session(&self, session_name: &str) -> bool {
        self.multiplexer.has_session(session_name)
    }
}

fn extract_last_match(haystack: &str, pattern: &str) -> Option<String> {
    let re = regex::Regex::new(pattern).ok()?;
    re.captures_iter(haystack)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(unix)]
fn write_mode_0600(path: &std::path::Path, contents: &[u8]) -> OrchestratorResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    std::fs::write(&tmp_path, contents)
        .map_err(|e| OrchestratorError::filesystem(path.display().to_string(), e.to_string()))?;
    std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| OrchestratorError::filesystem(path.display().to_string(), e.to_string()))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| OrchestratorError::filesystem(path.display().to_string(), e.to_string()))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_mode_0600(path: &std::path::Path, contents: &[u8]) -> OrchestratorResult<()> {
    std::fs::write(path, contents)
        .map_err(|e| OrchestratorError::filesystem(path.display().to_string(), e.to_string()))
}
