//! Process-wide configuration (spec §2.1 ambient stack), adapted from the
//! teacher's `harness::types::HarnessConfig::from_env`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Binary used to launch a worker's coding-agent process. Required —
    /// `start_worker` refuses to run with an empty value.
    pub agent_bin: String,

    /// Path to the `tmux` binary used by `TmuxMultiplexer`.
    pub tmux_bin: String,

    /// Commit message prefix used by `commit_progress`.
    pub commit_prefix: String,

    /// Upper bound on simultaneously running workers.
    pub max_concurrent_workers: usize,

    /// Default retry budget for newly created features.
    pub default_max_retries: u32,

    /// Default verification command timeout.
    pub verification_timeout_secs: u64,

    /// Completion-monitor poll interval.
    pub monitor_poll_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_bin: String::new(),
            tmux_bin: "tmux".to_string(),
            commit_prefix: "[orchestrator]".to_string(),
            max_concurrent_workers: crate::model::DEFAULT_MAX_CONCURRENT_WORKERS,
            default_max_retries: crate::model::DEFAULT_MAX_RETRIES,
            verification_timeout_secs: 300,
            monitor_poll_interval_secs: 10,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(bin) = std::env::var("ORCHESTRATOR_AGENT_BIN") {
            config.agent_bin = bin;
        }
        if let Ok(bin) = std::env::var("ORCHESTRATOR_TMUX_BIN") {
            config.tmux_bin = bin;
        }
        if let Ok(prefix) = std::env::var("ORCHESTRATOR_COMMIT_PREFIX") {
            config.commit_prefix = prefix;
        }
        if let Ok(val) = std::env::var("ORCHESTRATOR_MAX_CONCURRENT_WORKERS") {
            if let Ok(n) = val.parse() {
                config.max_concurrent_workers = n;
            }
        }
        if let Ok(val) = std::env::var("ORCHESTRATOR_DEFAULT_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                config.default_max_retries = n;
            }
        }
        if let Ok(val) = std::env::var("ORCHESTRATOR_VERIFICATION_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                config.verification_timeout_secs = n;
            }
        }
        if let Ok(val) = std::env::var("ORCHESTRATOR_MONITOR_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                config.monitor_poll_interval_secs = n;
            }
        }

        config
    }

    /// Default location for the registry's lazy-adoption scan, overridable
    /// for tests.
    pub fn default_projects_root() -> PathBuf {
        std::env::var_os("ORCHESTRATOR_PROJECTS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}
