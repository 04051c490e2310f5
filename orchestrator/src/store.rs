//! State store & journal (spec §4.2).
//!
//! Every write goes through temp-file + rename; `state.json.backup` is
//! written before each save for operator-driven recovery (never read
//! transparently by `load`, see SPEC_FULL.md §4.2.2).

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::Session;
use crate::security;

const STATE_FILE: &str = "state.json";
const STATE_BACKUP_FILE: &str = "state.json.backup";
const FEATURE_LIST_FILE: &str = "feature_list.json";
const NOTEBOOK_FILE: &str = "claude-progress.txt";
const INIT_SCRIPT_FILE: &str = "init.sh";

pub struct StateStore {
    orchestrator_dir: PathBuf,
    project_dir: PathBuf,
}

impl StateStore {
    /// `project_dir` must already be validated via `security::validate_project_dir`.
    pub fn new(project_dir: PathBuf) -> Self {
        let orchestrator_dir = project_dir.join(".claude").join("orchestrator");
        Self {
            orchestrator_dir,
            project_dir,
        }
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.orchestrator_dir.join("workers")
    }

    fn state_path(&self) -> PathBuf {
        self.orchestrator_dir.join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.orchestrator_dir.join(STATE_BACKUP_FILE)
    }

    fn feature_list_path(&self) -> PathBuf {
        self.orchestrator_dir.join(FEATURE_LIST_FILE)
    }

    fn notebook_path(&self) -> PathBuf {
        self.project_dir.join(NOTEBOOK_FILE)
    }

    fn init_script_path(&self) -> PathBuf {
        self.project_dir.join(INIT_SCRIPT_FILE)
    }

    /// Writes `contents` to `path` via temp-file + rename. On any failure
    /// the temp file is unlinked rather than left behind.
    fn atomic_write(path: &Path, contents: &[u8], mode: Option<u32>) -> OrchestratorResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OrchestratorError::filesystem(parent.display().to_string(), e.to_string()))?;
        }
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(format!(
            ".tmp.{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let tmp_path = PathBuf::from(tmp_name);
        let write_result = (|| -> std::io::Result<()> {
            std::fs::write(&tmp_path, contents)?;
            #[cfg(unix)]
            if let Some(mode) = mode {
                std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(mode))?;
            }
            let file = std::fs::File::open(&tmp_path)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, path)?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(OrchestratorError::filesystem(path.display().to_string(), e.to_string()));
        }
        Ok(())
    }

    /// Reads and schema-validates the Session. Returns `Ok(None)` if no
    /// state exists yet. Corruption is surfaced as `StateCorruption`, never
    /// silently defaulted.
    pub fn load(&self) -> OrchestratorResult<Option<Session>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| OrchestratorError::filesystem(path.display().to_string(), e.to_string()))?;
        let session: Session = serde_json::from_str(&raw).map_err(|e| OrchestratorError::StateCorruption {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(session))
    }

    /// Updates `last_updated`, truncates the progress log, and atomically
    /// writes `state.json` + `feature_list.json`, backing up the previous
    /// generation first. Also regenerates the notebook file (§4.2.1).
    pub fn save(&self, session: &mut Session) -> OrchestratorResult<()> {
        session.last_updated = Utc::now();
        while session.progress_log.len() > crate::model::MAX_PROGRESS_LOG_ENTRIES {
            session.progress_log.pop_front();
        }

        let state_path = self.state_path();
        if state_path.exists() {
            std::fs::copy(&state_path, self.backup_path())
                .map_err(|e| OrchestratorError::filesystem(state_path.display().to_string(), e.to_string()))?;
        }

        let state_json = serde_json::to_vec_pretty(session)?;
        Self::atomic_write(&state_path, &state_json, None)?;

        let digest = FeatureListDigest::from_session(session);
        let digest_json = serde_json::to_vec_pretty(&digest)?;
        Self::atomic_write(&self.feature_list_path(), &digest_json, None)?;

        self.rewrite_notebook(session)?;
        Ok(())
    }

    /// Loads, pushes a timestamped journal line, saves.
    pub fn append_log(&self, msg: impl Into<String>) -> OrchestratorResult<()> {
        let mut session = self
            .load()?
            .ok_or_else(|| OrchestratorError::invalid_input("no session to append to"))?;
        session.push_log(msg);
        self.save(&mut session)
    }

    fn rewrite_notebook(&self, session: &Session) -> OrchestratorResult<()> {
        let mut body = String::new();
        body.push_str(&format!(
            "# Orchestrator progress — {}\n\n",
            session.project_dir
        ));
        for line in &session.progress_log {
            body.push_str(line);
            body.push('\n');
        }
        Self::atomic_write(&self.notebook_path(), body.as_bytes(), None)
    }

    /// Removes `state.json`, `state.json.backup`, `feature_list.json`, and
    /// the notebook. Does not kill workers — callers compose with the
    /// worker manager for that.
    pub fn clear(&self) -> OrchestratorResult<()> {
        for path in [
            self.state_path(),
            self.backup_path(),
            self.feature_list_path(),
            self.notebook_path(),
        ] {
            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|e| OrchestratorError::filesystem(path.display().to_string(), e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Emits a `0700` shell script that `cd`s (shell-quoted) into the
    /// project, detects project type by marker files, installs deps if
    /// absent, and prints orchestrator status.
    pub fn write_init_script(&self) -> OrchestratorResult<()> {
        let quoted_dir = security::shell_quote(&self.project_dir.display().to_string());
        let script = format!(
            "#!/bin/sh\nset -e\ncd {quoted_dir}\n\n\
if [ -f Cargo.toml ]; then\n  echo 'Detected Rust project'\nelif [ -f package.json ]; then\n  echo 'Detected Node project'\n  [ -d node_modules ] || npm install\nelif [ -f go.mod ]; then\n  echo 'Detected Go project'\nelif [ -f pyproject.toml ] || [ -f requirements.txt ]; then\n  echo 'Detected Python project'\nelse\n  echo 'Unrecognised project type'\nfi\n\n\
echo 'Orchestrator state directory: .claude/orchestrator'\n"
        );
        Self::atomic_write(self.init_script_path().as_path(), script.as_bytes(), Some(0o700))
    }
}

#[derive(serde::Serialize)]
struct FeatureListDigest {
    project_dir: String,
    task_description: String,
    last_updated: chrono::DateTime<Utc>,
    features: Vec<FeatureDigestEntry>,
}

#[derive(serde::Serialize)]
struct FeatureDigestEntry {
    id: String,
    description: String,
    status: crate::model::FeatureStatus,
    passes: bool,
}

impl FeatureListDigest {
    fn from_session(session: &Session) -> Self {
        Self {
            project_dir: session.project_dir.clone(),
            task_description: session.task_description.clone(),
            last_updated: session.last_updated,
            features: session
                .features
                .iter()
                .map(|f| FeatureDigestEntry {
                    id: f.id.clone(),
                    description: f.description.clone(),
                    status: f.status,
                    passes: matches!(f.status, crate::model::FeatureStatus::Completed),
                })
                .collect(),
        }
    }
}
