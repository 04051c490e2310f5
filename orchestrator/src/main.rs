//! MCP server binary: exposes the operations in [`orchestrator_core::ops`] as
//! named tools over stdio, per spec §6's "thin binary crate" note.
//!
//! Each tool takes the operation's request struct as its parameters and
//! returns the response JSON-encoded, following the teacher's convention of
//! returning `Result<String, String>` from `#[tool]` methods.

use anyhow::Result;
use clap::Parser;
use rmcp::{
    handler::server::wrapper::Parameters,
    model::{ServerCapabilities, ServerInfo},
    schemars, tool, tool_router, ServerHandler, ServiceExt,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{stdin, stdout};

use orchestrator_core::ops::{
    AddFeatureRequest, CheckAllWorkersRequest, CheckWorkerRequest, CommitProgressRequest,
    MarkCompleteRequest, OrchestratorInitRequest, OrchestratorResetRequest, OrchestratorStatusRequest,
    PauseSessionRequest, ResumeSessionRequest, RetryFeatureRequest, RunVerificationRequest,
    SendWorkerMessageRequest, SetDependenciesRequest, StartParallelWorkersRequest, StartWorkerRequest,
};
use orchestrator_core::{OrchestratorConfig, OrchestratorService, Registry, TmuxMultiplexer};

/// Process-level CLI flags (spec §6): a project directory to adopt eagerly
/// at startup, and a log level override.
#[derive(Parser, Debug)]
#[command(author, version, about = "Supervisor engine for fleets of coding-agent worker processes", long_about = None)]
struct Args {
    /// Project directory to adopt at startup, if it already has on-disk
    /// orchestrator state. Optional — most projects are adopted lazily on
    /// first use instead (spec §5.1).
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace). Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Clone)]
struct OrchestratorServer {
    inner: Arc<OrchestratorService<TmuxMultiplexer>>,
    registry: Arc<Registry<TmuxMultiplexer>>,
}

impl OrchestratorServer {
    fn new(config: OrchestratorConfig) -> Self {
        let registry = Arc::new(Registry::new(config.clone(), Arc::new(TmuxMultiplexer::default)));
        Self {
            inner: Arc::new(OrchestratorService::new(config, registry.clone())),
            registry,
        }
    }

    fn registry(&self) -> Arc<Registry<TmuxMultiplexer>> {
        self.registry.clone()
    }
}

#[tool_router]
impl OrchestratorServer {
    #[tool(
        description = "Create a new supervised session for a project: a task description and the initial set of features, all starting pending. Fails if a dependency cycle is detected."
    )]
    async fn orchestrator_init(&self, Parameters(req): Parameters<OrchestratorInitRequest>) -> Result<String, String> {
        let response = self.inner.orchestrator_init(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Return the session's status: overall state, feature-count summary, optionally the full feature list, and the project's git status."
    )]
    async fn orchestrator_status(
        &self,
        Parameters(req): Parameters<OrchestratorStatusRequest>,
    ) -> Result<String, String> {
        let response = self.inner.orchestrator_status(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Kill every live worker and delete all on-disk orchestrator state for a project. Irreversible; requires confirm=true."
    )]
    async fn orchestrator_reset(
        &self,
        Parameters(req): Parameters<OrchestratorResetRequest>,
    ) -> Result<String, String> {
        let response = self.inner.orchestrator_reset(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Spawn one worker for a feature: writes its prompt file, opens a detached terminal-multiplexer session running the configured coding-agent binary, and marks the feature in_progress."
    )]
    async fn start_worker(&self, Parameters(req): Parameters<StartWorkerRequest>) -> Result<String, String> {
        let response = self.inner.start_worker(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Spawn workers for several independent features at once, admission-checked as a batch so a mid-batch failure leaves no partial state."
    )]
    async fn start_parallel_workers(
        &self,
        Parameters(req): Parameters<StartParallelWorkersRequest>,
    ) -> Result<String, String> {
        let response = self.inner.start_parallel_workers(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Check one worker: either its raw log tail from a byte cursor, or a compact heartbeat summary (last tool used, last file touched, how long it has been running)."
    )]
    async fn check_worker(&self, Parameters(req): Parameters<CheckWorkerRequest>) -> Result<String, String> {
        let response = self.inner.check_worker(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(description = "Return a heartbeat summary for every worker currently known to the session.")]
    async fn check_all_workers(
        &self,
        Parameters(req): Parameters<CheckAllWorkersRequest>,
    ) -> Result<String, String> {
        let response = self.inner.check_all_workers(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(description = "Send a text message into a running worker's inbox file. Requires the worker to still be running.")]
    async fn send_worker_message(
        &self,
        Parameters(req): Parameters<SendWorkerMessageRequest>,
    ) -> Result<String, String> {
        let response = self.inner.send_worker_message(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Record a client-acknowledged outcome for an in-progress feature. On success, requires the worker's .done marker to be present. On failure, applies the retry policy (bounded retries, then permanently failed)."
    )]
    async fn mark_complete(&self, Parameters(req): Parameters<MarkCompleteRequest>) -> Result<String, String> {
        let response = self.inner.mark_complete(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(description = "Reset a permanently-failed feature back to pending with a fresh retry budget.")]
    async fn retry_feature(&self, Parameters(req): Parameters<RetryFeatureRequest>) -> Result<String, String> {
        let response = self.inner.retry_feature(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Run the session's (or request-supplied) allow-listed verification commands in the project directory and return a pass/fail report per command."
    )]
    async fn run_verification(
        &self,
        Parameters(req): Parameters<RunVerificationRequest>,
    ) -> Result<String, String> {
        let response = self.inner.run_verification(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(description = "Add a new feature to an already-initialized session, validating its dependencies and that it does not introduce a cycle.")]
    async fn add_feature(&self, Parameters(req): Parameters<AddFeatureRequest>) -> Result<String, String> {
        let response = self.inner.add_feature(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(description = "Replace a feature's dependency set, validated against the full feature graph for cycles and unknown ids.")]
    async fn set_dependencies(
        &self,
        Parameters(req): Parameters<SetDependenciesRequest>,
    ) -> Result<String, String> {
        let response = self.inner.set_dependencies(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(description = "Pause a session: kills every live worker. Features left in_progress stay in_progress until explicitly restarted.")]
    async fn pause_session(&self, Parameters(req): Parameters<PauseSessionRequest>) -> Result<String, String> {
        let response = self.inner.pause_session(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(description = "Resume a paused session. Does not respawn workers; callers restart in-progress features explicitly via start_worker.")]
    async fn resume_session(&self, Parameters(req): Parameters<ResumeSessionRequest>) -> Result<String, String> {
        let response = self.inner.resume_session(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(description = "Stage and commit the project's working tree as a checkpoint, tagged with the feature id and message.")]
    async fn commit_progress(
        &self,
        Parameters(req): Parameters<CommitProgressRequest>,
    ) -> Result<String, String> {
        let response = self.inner.commit_progress(req).await.map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }
}

impl ServerHandler for OrchestratorServer {
    fn get_info(&self) -> ServerInfo {
        let instructions = "MCP server supervising fleets of coding-agent worker processes.\n\
             \n\
             Typical flow for a new project:\n\
             1. `orchestrator_init` with a task description and feature list\n\
             2. `start_worker` (or `start_parallel_workers`) for admissible features\n\
             3. `check_worker` / `check_all_workers` to watch progress\n\
             4. `mark_complete` once a worker signals done (success requires its .done marker)\n\
             5. `run_verification`, `commit_progress` to checkpoint\n\
             6. `orchestrator_status` at any point for an overview\n\
             \n\
             A feature that fails is retried automatically up to its retry budget; once that \
             budget is exhausted it stays failed until `retry_feature` resets it. `pause_session` \
             kills all live workers without touching feature state; `resume_session` does not \
             respawn them. `orchestrator_reset` is destructive and requires confirm=true.";

        ServerInfo {
            instructions: Some(instructions.to_string()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = match &args.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("orchestrator_core=info".parse().unwrap()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("starting orchestrator MCP server");

    let config = OrchestratorConfig::from_env();
    let server = OrchestratorServer::new(config);

    if let Some(project_dir) = &args.project_dir {
        match server.registry().get_or_adopt(project_dir).await {
            Ok(_) => tracing::info!(project_dir = %project_dir.display(), "adopted project at startup"),
            Err(e) => tracing::warn!(
                project_dir = %project_dir.display(),
                error = %e,
                "no existing orchestrator state for --project-dir; it will be adopted on first orchestrator_init"
            ),
        }
    }

    let registry_for_shutdown = server.registry();
    let transport = (stdin(), stdout());
    let service = server.serve(transport).await?;

    tokio::select! {
        result = service.waiting() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal, draining registry");
        }
    }

    registry_for_shutdown.shutdown_all().await;
    Ok(())
}
