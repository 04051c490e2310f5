//! Operations layer (spec §4.7, §4.7.2): one validated request/response
//! transaction per externally-invocable operation, following the teacher's
//! `harness::tools` request/response struct-pair convention.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::git::GitManager;
use crate::model::{
    Feature, FeatureStatus, FeatureSummary, GitStatus, Session, SessionStatus, TruncationNotice,
    VerificationConfig, WorkerRunState,
};
use crate::registry::Registry;
use crate::scheduler;
use crate::security;
use crate::verify;
use crate::worker::SessionMultiplexer;

pub struct OrchestratorService<M: SessionMultiplexer> {
    config: OrchestratorConfig,
    registry: Arc<Registry<M>>,
}

impl<M: SessionMultiplexer + 'static> OrchestratorService<M> {
    pub fn new(config: OrchestratorConfig, registry: Arc<Registry<M>>) -> Self {
        Self { config, registry }
    }

    fn validate_project_dir(req_dir: &str) -> OrchestratorResult<PathBuf> {
        security::validate_project_dir(Path::new(req_dir))
    }

    // ---------------------------------------------------------------
    // orchestrator_init
    // ---------------------------------------------------------------

    pub async fn orchestrator_init(
        &self,
        req: OrchestratorInitRequest,
    ) -> OrchestratorResult<OrchestratorInitResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;

        let mut seen = std::collections::HashSet::new();
        let mut features = Vec::with_capacity(req.features.len());
        for spec in &req.features {
            security::validate_feature_id(&spec.id)?;
            if !seen.insert(spec.id.clone()) {
                return Err(OrchestratorError::invalid_input(format!(
                    "duplicate feature id: {}",
                    spec.id
                )));
            }
            let mut feature = Feature::new(spec.id.clone(), spec.description.clone());
            feature.depends_on = spec.depends_on.clone().unwrap_or_default();
            features.push(feature);
        }
        let cycles = scheduler::detect_cycles(&features);
        if !cycles.is_empty() {
            return Err(OrchestratorError::invalid_input(format!(
                "dependency cycle detected involving: {}",
                cycles.join(", ")
            )));
        }

        let mut session = Session::new(project_dir.display().to_string(), req.task.clone());
        session.features = features;
        session.push_log("session initialized");

        let store = crate::store::StateStore::new(project_dir.clone());
        store.clear()?;
        store.save(&mut session)?;
        store.write_init_script()?;

        let total = session.features.len();
        self.registry.insert(project_dir, session, store).await;

        Ok(OrchestratorInitResponse {
            success: true,
            feature_count: total,
        })
    }

    // ---------------------------------------------------------------
    // orchestrator_status
    // ---------------------------------------------------------------

    pub async fn orchestrator_status(
        &self,
        req: OrchestratorStatusRequest,
    ) -> OrchestratorResult<OrchestratorStatusResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let session = shared.lock().await;

        let summary = FeatureSummary::from_features(&session.features);
        let include_features = req.include_features.unwrap_or(false);
        let max_features = req.max_features.unwrap_or(50);
        let (features, truncation) = if include_features {
            let shown = session.features.iter().take(max_features).cloned().collect::<Vec<_>>();
            let notice = TruncationNotice::truncated(shown.len(), session.features.len());
            (shown, notice)
        } else {
            (Vec::new(), TruncationNotice::none(session.features.len()))
        };

        let git_status = GitManager::new(&project_dir, &self.config.commit_prefix).status().ok();

        Ok(OrchestratorStatusResponse {
            status: session.status,
            summary,
            features,
            truncation,
            git_status,
        })
    }

    // ---------------------------------------------------------------
    // orchestrator_reset
    // ---------------------------------------------------------------

    pub async fn orchestrator_reset(
        &self,
        req: OrchestratorResetRequest,
    ) -> OrchestratorResult<OrchestratorResetResponse> {
        if !req.confirm {
            return Err(OrchestratorError::invalid_input(
                "orchestrator_reset requires confirm=true",
            ));
        }
        let project_dir = Self::validate_project_dir(&req.project_dir)?;

        if let Some(worker_manager) = self.registry.worker_manager_for(&project_dir).await {
            if let Ok(shared) = self.registry.get_or_adopt(&project_dir).await {
                let mut session = shared.lock().await;
                worker_manager.kill_all(&mut session);
            }
        }
        self.registry.remove(&project_dir).await;

        let store = crate::store::StateStore::new(project_dir);
        store.clear()?;

        Ok(OrchestratorResetResponse { success: true })
    }

    // ---------------------------------------------------------------
    // start_worker
    // ---------------------------------------------------------------

    pub async fn start_worker(&self, req: StartWorkerRequest) -> OrchestratorResult<StartWorkerResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let worker_manager = self
            .registry
            .worker_manager_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");
        let store = self
            .registry
            .store_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        let mut session = shared.lock().await;
        scheduler::check_admission(&session, &req.feature_id)?;
        let session_name = worker_manager.start_worker(&mut session, &req.feature_id, &req.prompt)?;
        store.save(&mut session)?;

        Ok(StartWorkerResponse { session_name })
    }

    // ---------------------------------------------------------------
    // start_parallel_workers
    // ---------------------------------------------------------------

    pub async fn start_parallel_workers(
        &self,
        req: StartParallelWorkersRequest,
    ) -> OrchestratorResult<StartParallelWorkersResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let worker_manager = self
            .registry
            .worker_manager_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");
        let store = self
            .registry
            .store_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        if req.features.len() != req.features.iter().map(|f| &f.feature_id).collect::<std::collections::HashSet<_>>().len() {
            return Err(OrchestratorError::invalid_input("duplicate feature id in batch"));
        }

        let mut session = shared.lock().await;
        let feature_ids: Vec<String> = req.features.iter().map(|f| f.feature_id.clone()).collect();
        scheduler::validate_workers(&session, &feature_ids)?;

        let mut session_names = Vec::with_capacity(req.features.len());
        for item in &req.features {
            let session_name = worker_manager.start_worker(&mut session, &item.feature_id, &item.prompt)?;
            session_names.push(session_name);
        }
        store.save(&mut session)?;

        Ok(StartParallelWorkersResponse { session_names })
    }

    // ---------------------------------------------------------------
    // check_worker / check_all_workers
    // ---------------------------------------------------------------

    pub async fn check_worker(&self, req: CheckWorkerRequest) -> OrchestratorResult<CheckWorkerResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let worker_manager = self
            .registry
            .worker_manager_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        let session = shared.lock().await;
        let worker = session
            .find_worker_for_feature(&req.feature_id)
            .ok_or_else(|| OrchestratorError::UnknownWorker {
                session_name: req.feature_id.clone(),
            })?
            .clone();
        drop(session);

        if req.heartbeat.unwrap_or(false) {
            let summary = worker_manager.check_worker_heartbeat(&worker.session_name, &worker)?;
            Ok(CheckWorkerResponse {
                session_name: worker.session_name,
                log_tail: None,
                cursor: None,
                heartbeat: Some(summary),
            })
        } else {
            let (tail, cursor) = worker_manager.check_worker_log(&worker.session_name, req.cursor.unwrap_or(0))?;
            Ok(CheckWorkerResponse {
                session_name: worker.session_name,
                log_tail: Some(tail),
                cursor: Some(cursor),
                heartbeat: None,
            })
        }
    }

    pub async fn check_all_workers(
        &self,
        req: CheckAllWorkersRequest,
    ) -> OrchestratorResult<CheckAllWorkersResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let worker_manager = self
            .registry
            .worker_manager_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        let session = shared.lock().await;
        let workers = session.workers.clone();
        drop(session);

        let mut summaries = Vec::with_capacity(workers.len());
        for worker in &workers {
            let summary = worker_manager.check_worker_heartbeat(&worker.session_name, worker)?;
            summaries.push((worker.session_name.clone(), worker.feature_id.clone(), summary));
        }

        Ok(CheckAllWorkersResponse {
            workers: summaries
                .into_iter()
                .map(|(session_name, feature_id, heartbeat)| WorkerHeartbeatEntry {
                    session_name,
                    feature_id,
                    heartbeat,
                })
                .collect(),
        })
    }

    // ---------------------------------------------------------------
    // send_worker_message
    // ---------------------------------------------------------------

    pub async fn send_worker_message(
        &self,
        req: SendWorkerMessageRequest,
    ) -> OrchestratorResult<SendWorkerMessageResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let worker_manager = self
            .registry
            .worker_manager_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        let session = shared.lock().await;
        let worker = session
            .find_worker_for_feature(&req.feature_id)
            .ok_or_else(|| OrchestratorError::UnknownWorker {
                session_name: req.feature_id.clone(),
            })?
            .clone();
        if !matches!(worker.status, WorkerRunState::Running) {
            return Err(OrchestratorError::InvalidTransition {
                from: format!("{:?}", worker.status),
                to: "message-sent".to_string(),
                reason: "worker is not running".to_string(),
            });
        }
        drop(session);

        worker_manager.send_worker_message(&worker.session_name, &req.text)?;
        Ok(SendWorkerMessageResponse { success: true })
    }

    // ---------------------------------------------------------------
    // mark_complete
    // ---------------------------------------------------------------

    /// Per §4.7.1, `success=true` requires an inline `.done` check — never
    /// only the cached WorkerStatus — so success can't be claimed ahead of
    /// the monitor observing it. `success=false` is never gated.
    pub async fn mark_complete(&self, req: MarkCompleteRequest) -> OrchestratorResult<MarkCompleteResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let worker_manager = self
            .registry
            .worker_manager_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");
        let store = self
            .registry
            .store_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        let mut session = shared.lock().await;
        let current_status = session
            .find_feature(&req.feature_id)
            .ok_or_else(|| OrchestratorError::UnknownFeature {
                feature_id: req.feature_id.clone(),
            })?
            .status;

        // markComplete(f, true) on an already-completed feature is a no-op (spec §8 idempotence).
        if req.success && matches!(current_status, FeatureStatus::Completed) {
            return Ok(MarkCompleteResponse {
                status: FeatureStatus::Completed,
            });
        }

        if !matches!(current_status, FeatureStatus::InProgress) {
            return Err(OrchestratorError::InvalidTransition {
                from: format!("{current_status:?}"),
                to: "completed-or-failed".to_string(),
                reason: "feature is not in_progress".to_string(),
            });
        }

        // Resolved from the feature's own `worker_id`, not a feature-id scan over
        // `session.workers` — a retry can otherwise leave a stale entry for a
        // previous attempt ahead of the current one.
        let session_name = session
            .find_feature(&req.feature_id)
            .and_then(|f| f.worker_id.clone());

        if req.success {
            let done = session_name
                .as_deref()
                .map(|name| worker_manager.has_done_marker(name))
                .unwrap_or(false);
            if !done {
                return Err(OrchestratorError::InvalidTransition {
                    from: "in_progress".to_string(),
                    to: "completed".to_string(),
                    reason: format!(
                        "expected <sessionName>.done for feature {} before declaring success",
                        req.feature_id
                    ),
                });
            }
            let feature = session
                .find_feature_mut(&req.feature_id)
                .ok_or_else(|| OrchestratorError::UnknownFeature {
                    feature_id: req.feature_id.clone(),
                })?;
            feature.status = FeatureStatus::Completed;
            feature.completed_at = Some(Utc::now());
            if let Some(notes) = &req.notes {
                feature.notes = notes.clone();
            }
            session.push_log(format!("feature {} marked complete", req.feature_id));
            if let Some(name) = &session_name {
                if let Some(worker) = session.workers.iter_mut().find(|w| &w.session_name == name) {
                    worker.status = WorkerRunState::Completed;
                }
            }
        } else {
            // Kill the associated worker session if still live (spec §4.5) before
            // the feature goes back to pending, so the old agent process cannot
            // keep writing the feature's prompt/log/done files under a new worker.
            if let Some(name) = &session_name {
                worker_manager.kill_worker(&mut session, name)?;
            }
            let feature = session
                .find_feature_mut(&req.feature_id)
                .ok_or_else(|| OrchestratorError::UnknownFeature {
                    feature_id: req.feature_id.clone(),
                })?;
            scheduler::apply_retry_policy(feature, req.notes.clone());
            session.push_log(format!("feature {} reported failure", req.feature_id));
        }

        session.recompute_status();
        store.save(&mut session)?;

        Ok(MarkCompleteResponse {
            status: session.find_feature(&req.feature_id).unwrap().status,
        })
    }

    // ---------------------------------------------------------------
    // retry_feature
    // ---------------------------------------------------------------

    pub async fn retry_feature(&self, req: RetryFeatureRequest) -> OrchestratorResult<RetryFeatureResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let store = self
            .registry
            .store_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        let mut session = shared.lock().await;
        let feature = session
            .find_feature_mut(&req.feature_id)
            .ok_or_else(|| OrchestratorError::UnknownFeature {
                feature_id: req.feature_id.clone(),
            })?;
        // Already-pending is a no-op (spec §8 idempotence), not an error.
        if matches!(feature.status, FeatureStatus::Pending) {
            return Ok(RetryFeatureResponse { success: true });
        }
        if !matches!(feature.status, FeatureStatus::Failed) {
            return Err(OrchestratorError::InvalidTransition {
                from: format!("{:?}", feature.status),
                to: "pending".to_string(),
                reason: "retry_feature requires a failed feature".to_string(),
            });
        }
        feature.attempts = 0;
        feature.status = FeatureStatus::Pending;
        feature.last_error = None;
        feature.worker_id = None;
        feature.started_at = None;

        session.recompute_status();
        session.push_log(format!("feature {} manually retried", req.feature_id));
        store.save(&mut session)?;

        Ok(RetryFeatureResponse { success: true })
    }

    // ---------------------------------------------------------------
    // run_verification
    // ---------------------------------------------------------------

    pub async fn run_verification(
        &self,
        req: RunVerificationRequest,
    ) -> OrchestratorResult<RunVerificationResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let store = self
            .registry
            .store_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        let (commands, fail_on_error, timeout_secs) = {
            let session = shared.lock().await;
            match &req.commands {
                Some(commands) => (commands.clone(), req.fail_on_error.unwrap_or(false), req.timeout_secs),
                None => {
                    let cfg: &VerificationConfig = &session.verification_config;
                    (cfg.commands.clone(), cfg.fail_on_error, cfg.timeout_secs)
                }
            }
        };

        let report = verify::run_verification(&project_dir, &commands, fail_on_error, timeout_secs).await?;

        let mut session = shared.lock().await;
        if let Some(feature_id) = &req.feature_id {
            if let Some(feature) = session.find_feature_mut(feature_id) {
                feature.validation_result = Some(report.passed);
            }
        }
        session.push_log(format!(
            "verification run: {} command(s), passed={}",
            report.results.len(),
            report.passed
        ));
        store.save(&mut session)?;

        Ok(RunVerificationResponse { report })
    }

    // ---------------------------------------------------------------
    // add_feature
    // ---------------------------------------------------------------

    pub async fn add_feature(&self, req: AddFeatureRequest) -> OrchestratorResult<AddFeatureResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let store = self
            .registry
            .store_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        security::validate_feature_id(&req.id)?;
        let mut session = shared.lock().await;
        if session.find_feature(&req.id).is_some() {
            return Err(OrchestratorError::invalid_input(format!(
                "feature id already exists: {}",
                req.id
            )));
        }
        let depends_on = req.depends_on.clone().unwrap_or_default();
        for dep in &depends_on {
            if session.find_feature(dep).is_none() {
                return Err(OrchestratorError::invalid_input(format!(
                    "unknown dependency id: {dep}"
                )));
            }
        }

        let mut feature = Feature::new(req.id.clone(), req.description.clone());
        feature.depends_on = depends_on;
        let mut projected = session.features.clone();
        projected.push(feature.clone());
        let cycles = scheduler::detect_cycles(&projected);
        if !cycles.is_empty() {
            return Err(OrchestratorError::invalid_input(format!(
                "dependency cycle detected involving: {}",
                cycles.join(", ")
            )));
        }

        session.features.push(feature);
        session.recompute_status();
        session.push_log(format!("feature {} added", req.id));
        store.save(&mut session)?;

        Ok(AddFeatureResponse { success: true })
    }

    // ---------------------------------------------------------------
    // set_dependencies
    // ---------------------------------------------------------------

    pub async fn set_dependencies(
        &self,
        req: SetDependenciesRequest,
    ) -> OrchestratorResult<SetDependenciesResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let store = self
            .registry
            .store_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        let mut session = shared.lock().await;
        scheduler::validate_dependency_set(&session, &req.feature_id, &req.depends_on)?;
        let feature = session
            .find_feature_mut(&req.feature_id)
            .ok_or_else(|| OrchestratorError::UnknownFeature {
                feature_id: req.feature_id.clone(),
            })?;
        feature.depends_on = req.depends_on.clone();
        session.push_log(format!("dependencies for {} updated", req.feature_id));
        store.save(&mut session)?;

        Ok(SetDependenciesResponse { success: true })
    }

    // ---------------------------------------------------------------
    // pause_session / resume_session
    // ---------------------------------------------------------------

    pub async fn pause_session(&self, req: PauseSessionRequest) -> OrchestratorResult<PauseSessionResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let worker_manager = self
            .registry
            .worker_manager_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");
        let store = self
            .registry
            .store_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        let mut session = shared.lock().await;
        if matches!(session.status, SessionStatus::Paused) {
            return Err(OrchestratorError::InvalidTransition {
                from: "paused".to_string(),
                to: "paused".to_string(),
                reason: "session is already paused".to_string(),
            });
        }
        worker_manager.kill_all(&mut session);
        session.status = SessionStatus::Paused;
        session.push_log("session paused");
        store.save(&mut session)?;

        Ok(PauseSessionResponse { success: true })
    }

    pub async fn resume_session(&self, req: ResumeSessionRequest) -> OrchestratorResult<ResumeSessionResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let store = self
            .registry
            .store_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        let mut session = shared.lock().await;
        if !matches!(session.status, SessionStatus::Paused) {
            return Err(OrchestratorError::InvalidTransition {
                from: format!("{:?}", session.status),
                to: "in_progress".to_string(),
                reason: "resume_session requires a paused session".to_string(),
            });
        }
        // Workers killed by pause_session stay killed; any feature left
        // in_progress without a live worker must be restarted explicitly
        // via start_worker, since resume never re-spawns processes itself.
        session.recompute_status();
        session.push_log("session resumed");
        store.save(&mut session)?;

        Ok(ResumeSessionResponse { success: true })
    }

    // ---------------------------------------------------------------
    // commit_progress
    // ---------------------------------------------------------------

    pub async fn commit_progress(
        &self,
        req: CommitProgressRequest,
    ) -> OrchestratorResult<CommitProgressResponse> {
        let project_dir = Self::validate_project_dir(&req.project_dir)?;
        let shared = self.registry.get_or_adopt(&project_dir).await?;
        let store = self
            .registry
            .store_for(&project_dir)
            .await
            .expect("registry entry exists after get_or_adopt");

        let git = GitManager::new(&project_dir, &self.config.commit_prefix);
        let before_commit = git.current_commit().unwrap_or_default();
        let commit_hash = git.create_checkpoint(&req.feature_id_for_message(), &req.message)?;
        let diff_stat = git.diff_stat(&before_commit).ok();

        let mut session = shared.lock().await;
        if let Some(feature) = session.find_feature_mut(&req.feature_id_for_message()) {
            feature.git_verification = Some(crate::model::GitVerification {
                before_commit: feature
                    .git_verification
                    .as_ref()
                    .map(|g| g.before_commit.clone())
                    .unwrap_or(before_commit),
                after_commit: Some(commit_hash.clone()),
                diff_stat,
            });
        }
        session.push_log(format!("committed progress: {}", req.message));
        store.save(&mut session)?;

        Ok(CommitProgressResponse { commit_hash })
    }
}

// =====================================================================
// Request/response types
// =====================================================================

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct FeatureSpec {
    #[schemars(description = "Stable identifier, [a-zA-Z0-9_-]{1,64}")]
    pub id: String,
    #[schemars(description = "Human-readable description of the feature")]
    pub description: String,
    #[schemars(description = "Feature ids that must complete before this one is admitted")]
    pub depends_on: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct OrchestratorInitRequest {
    #[schemars(description = "Absolute path to the project directory")]
    pub project_dir: String,
    #[schemars(description = "Free-text description of the overall task")]
    pub task: String,
    #[schemars(description = "Initial feature set, all created pending")]
    pub features: Vec<FeatureSpec>,
}

#[derive(Debug, Serialize)]
pub struct OrchestratorInitResponse {
    pub success: bool,
    pub feature_count: usize,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct OrchestratorStatusRequest {
    pub project_dir: String,
    #[schemars(description = "Include the full (possibly truncated) feature list")]
    pub include_features: Option<bool>,
    #[schemars(description = "Maximum features to return when include_features is set")]
    pub max_features: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct OrchestratorStatusResponse {
    pub status: SessionStatus,
    pub summary: FeatureSummary,
    pub features: Vec<Feature>,
    pub truncation: TruncationNotice,
    pub git_status: Option<GitStatus>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct OrchestratorResetRequest {
    pub project_dir: String,
    #[schemars(description = "Must be true; a bare reset request without confirmation is rejected")]
    pub confirm: bool,
}

#[derive(Debug, Serialize)]
pub struct OrchestratorResetResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct StartWorkerRequest {
    pub project_dir: String,
    pub feature_id: String,
    #[schemars(description = "Prompt text written to the worker's 0600 prompt file")]
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct StartWorkerResponse {
    pub session_name: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ParallelWorkerItem {
    pub feature_id: String,
    pub prompt: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct StartParallelWorkersRequest {
    pub project_dir: String,
    pub features: Vec<ParallelWorkerItem>,
}

#[derive(Debug, Serialize)]
pub struct StartParallelWorkersResponse {
    pub session_names: Vec<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckWorkerRequest {
    pub project_dir: String,
    pub feature_id: String,
    #[schemars(description = "Byte offset into the worker log to resume reading from")]
    pub cursor: Option<u64>,
    #[schemars(description = "Return a compact heartbeat summary instead of the raw log tail")]
    pub heartbeat: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct CheckWorkerResponse {
    pub session_name: String,
    pub log_tail: Option<String>,
    pub cursor: Option<u64>,
    pub heartbeat: Option<crate::worker::HeartbeatSummary>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckAllWorkersRequest {
    pub project_dir: String,
}

#[derive(Debug, Serialize)]
pub struct WorkerHeartbeatEntry {
    pub session_name: String,
    pub feature_id: String,
    pub heartbeat: crate::worker::HeartbeatSummary,
}

#[derive(Debug, Serialize)]
pub struct CheckAllWorkersResponse {
    pub workers: Vec<WorkerHeartbeatEntry>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SendWorkerMessageRequest {
    pub project_dir: String,
    pub feature_id: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SendWorkerMessageResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct MarkCompleteRequest {
    pub project_dir: String,
    pub feature_id: String,
    pub success: bool,
    #[schemars(description = "On failure: the error text driving the retry policy. On success: optional notes.")]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MarkCompleteResponse {
    pub status: FeatureStatus,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RetryFeatureRequest {
    pub project_dir: String,
    pub feature_id: String,
}

#[derive(Debug, Serialize)]
pub struct RetryFeatureResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunVerificationRequest {
    pub project_dir: String,
    #[schemars(description = "Feature to attach the verification result to, if any")]
    pub feature_id: Option<String>,
    #[schemars(description = "Overrides the session's configured verification commands")]
    pub commands: Option<Vec<String>>,
    pub fail_on_error: Option<bool>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RunVerificationResponse {
    pub report: verify::VerificationReport,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AddFeatureRequest {
    pub project_dir: String,
    pub id: String,
    pub description: String,
    pub depends_on: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct AddFeatureResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SetDependenciesRequest {
    pub project_dir: String,
    pub feature_id: String,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SetDependenciesResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct PauseSessionRequest {
    pub project_dir: String,
}

#[derive(Debug, Serialize)]
pub struct PauseSessionResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ResumeSessionRequest {
    pub project_dir: String,
}

#[derive(Debug, Serialize)]
pub struct ResumeSessionResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CommitProgressRequest {
    pub project_dir: String,
    #[schemars(description = "Feature this checkpoint documents, used to tag the commit message")]
    pub feature_id: Option<String>,
    pub message: String,
}

impl CommitProgressRequest {
    fn feature_id_for_message(&self) -> String {
        self.feature_id.clone().unwrap_or_else(|| "session".to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct CommitProgressResponse {
    pub commit_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::FakeMultiplexer;

    fn service_with_temp_dir() -> (tempfile::TempDir, OrchestratorService<FakeMultiplexer>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.agent_bin = "fake-agent".to_string();
        let registry = Arc::new(Registry::new(config.clone(), Arc::new(FakeMultiplexer::default)));
        (dir, OrchestratorService::new(config, registry))
    }

    #[tokio::test]
    async fn init_then_status_round_trips() {
        let (dir, service) = service_with_temp_dir();
        let project_dir = dir.path().display().to_string();

        service
            .orchestrator_init(OrchestratorInitRequest {
                project_dir: project_dir.clone(),
                task: "build a thing".to_string(),
                features: vec![FeatureSpec {
                    id: "f1".to_string(),
                    description: "first feature".to_string(),
                    depends_on: None,
                }],
            })
            .await
            .unwrap();

        let status = service
            .orchestrator_status(OrchestratorStatusRequest {
                project_dir,
                include_features: Some(true),
                max_features: None,
            })
            .await
            .unwrap();
        assert_eq!(status.summary.total, 1);
        assert_eq!(status.features.len(), 1);
    }

    #[tokio::test]
    async fn init_rejects_dependency_cycle() {
        let (dir, service) = service_with_temp_dir();
        let project_dir = dir.path().display().to_string();
        let result = service
            .orchestrator_init(OrchestratorInitRequest {
                project_dir,
                task: "task".to_string(),
                features: vec![
                    FeatureSpec {
                        id: "f1".to_string(),
                        description: "d".to_string(),
                        depends_on: Some(vec!["f2".to_string()]),
                    },
                    FeatureSpec {
                        id: "f2".to_string(),
                        description: "d".to_string(),
                        depends_on: Some(vec!["f1".to_string()]),
                    },
                ],
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn start_worker_then_mark_complete_requires_done_marker() {
        let (dir, service) = service_with_temp_dir();
        let project_dir = dir.path().display().to_string();
        service
            .orchestrator_init(OrchestratorInitRequest {
                project_dir: project_dir.clone(),
                task: "task".to_string(),
                features: vec![FeatureSpec {
                    id: "f1".to_string(),
                    description: "d".to_string(),
                    depends_on: None,
                }],
            })
            .await
            .unwrap();

        service
            .start_worker(StartWorkerRequest {
                project_dir: project_dir.clone(),
                feature_id: "f1".to_string(),
                prompt: "do it".to_string(),
            })
            .await
            .unwrap();

        let result = service
            .mark_complete(MarkCompleteRequest {
                project_dir: project_dir.clone(),
                feature_id: "f1".to_string(),
                success: true,
                notes: None,
            })
            .await;
        assert!(result.is_err());

        let result = service
            .mark_complete(MarkCompleteRequest {
                project_dir,
                feature_id: "f1".to_string(),
                success: false,
                notes: Some("boom".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(result.status, FeatureStatus::Pending);
    }

    #[tokio::test]
    async fn add_feature_rejects_unknown_dependency() {
        let (dir, service) = service_with_temp_dir();
        let project_dir = dir.path().display().to_string();
        service
            .orchestrator_init(OrchestratorInitRequest {
                project_dir: project_dir.clone(),
                task: "task".to_string(),
                features: vec![],
            })
            .await
            .unwrap();

        let result = service
            .add_feature(AddFeatureRequest {
                project_dir,
                id: "f1".to_string(),
                description: "d".to_string(),
                depends_on: Some(vec!["ghost".to_string()]),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reset_requires_explicit_confirmation() {
        let (dir, service) = service_with_temp_dir();
        let project_dir = dir.path().display().to_string();
        let result = service
            .orchestrator_reset(OrchestratorResetRequest {
                project_dir,
                confirm: false,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn mark_complete_on_already_completed_feature_is_a_no_op() {
        let (dir, service) = service_with_temp_dir();
        let project_dir = dir.path().display().to_string();
        service
            .orchestrator_init(OrchestratorInitRequest {
                project_dir: project_dir.clone(),
                task: "task".to_string(),
                features: vec![FeatureSpec {
                    id: "f1".to_string(),
                    description: "d".to_string(),
                    depends_on: None,
                }],
            })
            .await
            .unwrap();

        let start = service
            .start_worker(StartWorkerRequest {
                project_dir: project_dir.clone(),
                feature_id: "f1".to_string(),
                prompt: "do it".to_string(),
            })
            .await
            .unwrap();

        let done_marker = dir
            .path()
            .join(".claude")
            .join("orchestrator")
            .join("workers")
            .join(format!("{}.done", start.session_name));
        std::fs::write(&done_marker, b"").unwrap();

        let first = service
            .mark_complete(MarkCompleteRequest {
                project_dir: project_dir.clone(),
                feature_id: "f1".to_string(),
                success: true,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(first.status, FeatureStatus::Completed);

        let second = service
            .mark_complete(MarkCompleteRequest {
                project_dir,
                feature_id: "f1".to_string(),
                success: true,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(second.status, FeatureStatus::Completed);
    }

    #[tokio::test]
    async fn retry_feature_on_pending_feature_is_a_no_op() {
        let (dir, service) = service_with_temp_dir();
        let project_dir = dir.path().display().to_string();
        service
            .orchestrator_init(OrchestratorInitRequest {
                project_dir: project_dir.clone(),
                task: "task".to_string(),
                features: vec![FeatureSpec {
                    id: "f1".to_string(),
                    description: "d".to_string(),
                    depends_on: None,
                }],
            })
            .await
            .unwrap();

        let result = service
            .retry_feature(RetryFeatureRequest {
                project_dir: project_dir.clone(),
                feature_id: "f1".to_string(),
            })
            .await
            .unwrap();
        assert!(result.success);

        let status = service
            .orchestrator_status(OrchestratorStatusRequest {
                project_dir,
                include_features: Some(true),
                max_features: None,
            })
            .await
            .unwrap();
        let feature = status.features.into_iter().find(|f| f.id == "f1").unwrap();
        assert_eq!(feature.status, FeatureStatus::Pending);
    }

    #[tokio::test]
    async fn retry_then_success_resolves_the_current_worker_and_kills_the_stale_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.agent_bin = "fake-agent".to_string();
        let registry = Arc::new(Registry::new(config.clone(), Arc::new(FakeMultiplexer::default)));
        let service = OrchestratorService::new(config, registry.clone());
        let project_dir = dir.path().display().to_string();

        service
            .orchestrator_init(OrchestratorInitRequest {
                project_dir: project_dir.clone(),
                task: "task".to_string(),
                features: vec![FeatureSpec {
                    id: "f1".to_string(),
                    description: "d".to_string(),
                    depends_on: None,
                }],
            })
            .await
            .unwrap();

        let first = service
            .start_worker(StartWorkerRequest {
                project_dir: project_dir.clone(),
                feature_id: "f1".to_string(),
                prompt: "attempt one".to_string(),
            })
            .await
            .unwrap();

        let worker_manager = registry.worker_manager_for(Path::new(&project_dir)).await.unwrap();
        assert!(worker_manager.has_live_session(&first.session_name));

        // Reported failure: Scenario C. Must kill the first attempt's live
        // session and leave no stale WorkerStatus behind.
        service
            .mark_complete(MarkCompleteRequest {
                project_dir: project_dir.clone(),
                feature_id: "f1".to_string(),
                success: false,
                notes: Some("oom".to_string()),
            })
            .await
            .unwrap();
        assert!(!worker_manager.has_live_session(&first.session_name));

        let second = service
            .start_worker(StartWorkerRequest {
                project_dir: project_dir.clone(),
                feature_id: "f1".to_string(),
                prompt: "attempt two".to_string(),
            })
            .await
            .unwrap();
        assert_ne!(first.session_name, second.session_name);

        let done_marker = dir
            .path()
            .join(".claude")
            .join("orchestrator")
            .join("workers")
            .join(format!("{}.done", second.session_name));
        std::fs::write(&done_marker, b"").unwrap();

        // Would previously resolve to the stale first-attempt session name
        // and fail with InvalidTransition because it never got a .done file.
        let result = service
            .mark_complete(MarkCompleteRequest {
                project_dir,
                feature_id: "f1".to_string(),
                success: true,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(result.status, FeatureStatus::Completed);
    }
}
