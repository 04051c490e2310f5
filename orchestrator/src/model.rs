//! The Session/Feature/WorkerStatus aggregate (spec §3) and its read-side
//! summary types (spec §3.1).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const MAX_PROGRESS_LOG_ENTRIES: usize = 1000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MAX_CONCURRENT_WORKERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Reviewing,
    Completed,
    CompletedWithFailures,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRunState {
    Running,
    Completed,
    Crashed,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GitVerification {
    pub before_commit: String,
    pub after_commit: Option<String>,
    pub diff_stat: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Feature {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub last_error: Option<String>,
    pub status: FeatureStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_verification: Option<GitVerification>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Feature {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            notes: String::new(),
            last_error: None,
            status: FeatureStatus::Pending,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            worker_id: None,
            started_at: None,
            completed_at: None,
            depends_on: Vec::new(),
            validation: None,
            validation_result: None,
            git_verification: None,
        }
    }

    pub fn is_retry_budget_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WorkerStatus {
    pub session_name: String,
    pub feature_id: String,
    pub started_at: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    pub status: WorkerRunState,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct VerificationConfig {
    #[serde(default)]
    pub fail_on_error: bool,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Session {
    pub project_dir: String,
    #[serde(default)]
    pub task_description: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub features: Vec<Feature>,
    pub workers: Vec<WorkerStatus>,
    #[serde(default)]
    pub progress_log: VecDeque<String>,
    #[serde(default)]
    pub verification_config: VerificationConfig,
}

impl Session {
    pub fn new(project_dir: impl Into<String>, task_description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project_dir: project_dir.into(),
            task_description: task_description.into(),
            status: SessionStatus::InProgress,
            start_time: now,
            last_updated: now,
            completed_at: None,
            features: Vec::new(),
            workers: Vec::new(),
            progress_log: VecDeque::new(),
            verification_config: VerificationConfig::default(),
        }
    }

    pub fn find_feature(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn find_feature_mut(&mut self, id: &str) -> Option<&mut Feature> {
        self.features.iter_mut().find(|f| f.id == id)
    }

    pub fn find_worker(&self, session_name: &str) -> Option<&WorkerStatus> {
        self.workers.iter().find(|w| w.session_name == session_name)
    }

    pub fn find_worker_for_feature(&self, feature_id: &str) -> Option<&WorkerStatus> {
        self.workers.iter().find(|w| w.feature_id == feature_id)
    }

    pub fn push_log(&mut self, msg: impl Into<String>) {
        let timestamp = Utc::now().to_rfc3339();
        self.progress_log
            .push_back(format!("[{timestamp}] {}", msg.into()));
        while self.progress_log.len() > MAX_PROGRESS_LOG_ENTRIES {
            self.progress_log.pop_front();
        }
    }

    /// Recomputes `status` from feature states (spec §3 invariant).
    pub fn recompute_status(&mut self) {
        if matches!(self.status, SessionStatus::Paused) {
            return;
        }
        let any_in_progress_or_pending = self
            .features
            .iter()
            .any(|f| matches!(f.status, FeatureStatus::InProgress | FeatureStatus::Pending));
        let any_failed = self
            .features
            .iter()
            .any(|f| matches!(f.status, FeatureStatus::Failed));
        let all_completed = !self.features.is_empty()
            && self
                .features
                .iter()
                .all(|f| matches!(f.status, FeatureStatus::Completed));

        self.status = if all_completed {
            self.completed_at = Some(Utc::now());
            SessionStatus::Completed
        } else if any_failed && !any_in_progress_or_pending {
            self.completed_at = Some(Utc::now());
            SessionStatus::CompletedWithFailures
        } else {
            SessionStatus::InProgress
        };
    }
}

/// Spec §3.1 — aggregated read-side view used by `orchestrator_status`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct FeatureSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub completion_percent: f32,
}

impl FeatureSummary {
    pub fn from_features(features: &[Feature]) -> Self {
        let total = features.len();
        let completed = features
            .iter()
            .filter(|f| matches!(f.status, FeatureStatus::Completed))
            .count();
        let failed = features
            .iter()
            .filter(|f| matches!(f.status, FeatureStatus::Failed))
            .count();
        let in_progress = features
            .iter()
            .filter(|f| matches!(f.status, FeatureStatus::InProgress))
            .count();
        let pending = features
            .iter()
            .filter(|f| matches!(f.status, FeatureStatus::Pending))
            .count();
        let completion_percent = if total == 0 {
            0.0
        } else {
            (completed as f32 / total as f32) * 100.0
        };
        Self {
            total,
            completed,
            failed,
            in_progress,
            pending,
            completion_percent,
        }
    }
}

/// Spec §3.1 — surfaces a caller-bounded read window without silently
/// hiding data.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct TruncationNotice {
    pub truncated: bool,
    pub shown: usize,
    pub total: usize,
}

impl TruncationNotice {
    pub fn none(total: usize) -> Self {
        Self {
            truncated: false,
            shown: total,
            total,
        }
    }

    pub fn truncated(shown: usize, total: usize) -> Self {
        Self {
            truncated: shown < total,
            shown,
            total,
        }
    }
}

/// Spec §3.1 — surfaced by `orchestrator_status` and `commit_progress`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct GitStatus {
    pub branch: String,
    pub commit: String,
    pub has_uncommitted_changes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recompute_status_all_completed() {
        let mut session = Session::new("/tmp/proj", "task");
        session.features.push(Feature {
            status: FeatureStatus::Completed,
            ..Feature::new("f1", "d")
        });
        session.recompute_status();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.completed_at.is_some());
    }

    #[test]
    fn recompute_status_failed_with_no_pending() {
        let mut session = Session::new("/tmp/proj", "task");
        session.features.push(Feature {
            status: FeatureStatus::Failed,
            ..Feature::new("f1", "d")
        });
        session.features.push(Feature {
            status: FeatureStatus::Completed,
            ..Feature::new("f2", "d")
        });
        session.recompute_status();
        assert_eq!(session.status, SessionStatus::CompletedWithFailures);
    }

    #[test]
    fn recompute_status_still_pending() {
        let mut session = Session::new("/tmp/proj", "task");
        session.features.push(Feature::new("f1", "d"));
        session.recompute_status();
        assert_eq!(session.status, SessionStatus::InProgress);
    }

    #[test]
    fn progress_log_bounded_at_1000() {
        let mut session = Session::new("/tmp/proj", "task");
        for i in 0..1100 {
            session.push_log(format!("entry {i}"));
        }
        assert_eq!(session.progress_log.len(), MAX_PROGRESS_LOG_ENTRIES);
        assert!(session.progress_log.back().unwrap().contains("entry 1099"));
    }

    #[test]
    fn feature_summary_counts() {
        let features = vec![
            Feature {
                status: FeatureStatus::Completed,
                ..Feature::new("f1", "d")
            },
            Feature {
                status: FeatureStatus::Failed,
                ..Feature::new("f2", "d")
            },
            Feature::new("f3", "d"),
        ];
        let summary = FeatureSummary::from_features(&features);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
    }
}
