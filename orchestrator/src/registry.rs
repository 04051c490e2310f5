//! Process-wide project registry (spec §5.1), generalizing the teacher's
//! single-session `SharedHarnessState` into a keyed map so one server
//! process can supervise many projects at once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::Session;
use crate::monitor::Monitor;
use crate::store::StateStore;
use crate::worker::{SessionMultiplexer, WorkerManager};

pub type SharedSession = Arc<Mutex<Session>>;

/// Everything the registry owns for one supervised project.
pub struct ProjectHandle<M: SessionMultiplexer> {
    pub session: SharedSession,
    pub store: Arc<StateStore>,
    pub worker_manager: Arc<WorkerManager<M>>,
    monitor: Option<Monitor>,
}

/// `Arc<Mutex<HashMap<PathBuf, ProjectHandle>>>` per spec §5.1, wrapped in
/// a named type so call sites read as intent rather than generic plumbing.
pub struct Registry<M: SessionMultiplexer> {
    config: OrchestratorConfig,
    multiplexer_factory: Arc<dyn Fn() -> M + Send + Sync>,
    projects: Mutex<HashMap<PathBuf, ProjectHandle<M>>>,
}

impl<M: SessionMultiplexer + 'static> Registry<M> {
    pub fn new(config: OrchestratorConfig, multiplexer_factory: Arc<dyn Fn() -> M + Send + Sync>) -> Self {
        Self {
            config,
            multiplexer_factory,
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a brand-new project entry and spawns its monitor. Used only
    /// by `orchestrator_init`; callers must have already written the
    /// initial Session to disk via `store.save`.
    pub async fn insert(&self, project_dir: PathBuf, session: Session, store: StateStore) {
        let store = Arc::new(store);
        let worker_manager = Arc::new(WorkerManager::new(
            store.workers_dir(),
            self.config.agent_bin.clone(),
            (self.multiplexer_factory)(),
        ));
        let session = Arc::new(Mutex::new(session));
        let monitor = Monitor::spawn(store.clone(), worker_manager.clone(), session.clone());

        let mut projects = self.projects.lock().await;
        if let Some(previous) = projects.remove(&project_dir) {
            if let Some(prev_monitor) = previous.monitor {
                let _ = prev_monitor.shutdown().await;
            }
        }
        projects.insert(
            project_dir,
            ProjectHandle {
                session,
                store,
                worker_manager,
                monitor: Some(monitor),
            },
        );
    }

    /// Returns the entry for `project_dir`, lazily adopting it from disk if
    /// it is not yet registered but has on-disk state (spec §5.1). Returns
    /// `None` only when neither the registry nor disk has anything for
    /// this project — callers must map that to `UnknownFeature`/
    /// `InvalidInput` as appropriate, never create an empty session.
    pub async fn get_or_adopt(&self, project_dir: &Path) -> OrchestratorResult<SharedSession> {
        {
            let projects = self.projects.lock().await;
            if let Some(handle) = projects.get(project_dir) {
                return Ok(handle.session.clone());
            }
        }

        let store = StateStore::new(project_dir.to_path_buf());
        let session = store.load()?.ok_or_else(|| {
            OrchestratorError::invalid_input(format!(
                "no orchestrator state for project directory {}",
                project_dir.display()
            ))
        })?;

        let store = Arc::new(store);
        let worker_manager = Arc::new(WorkerManager::new(
            store.workers_dir(),
            self.config.agent_bin.clone(),
            (self.multiplexer_factory)(),
        ));
        let shared_session = Arc::new(Mutex::new(session));
        let monitor = Monitor::spawn(store.clone(), worker_manager.clone(), shared_session.clone());

        let mut projects = self.projects.lock().await;
        // Another task may have adopted the same project while we were
        // loading from disk; prefer whichever entry is already there.
        let entry = projects.entry(project_dir.to_path_buf()).or_insert(ProjectHandle {
            session: shared_session.clone(),
            store,
            worker_manager,
            monitor: Some(monitor),
        });
        Ok(entry.session.clone())
    }

    /// Tears the monitor down and removes the entry, ahead of
    /// `orchestrator_reset` clearing the on-disk files.
    pub async fn remove(&self, project_dir: &Path) {
        let removed = {
            let mut projects = self.projects.lock().await;
            projects.remove(project_dir)
        };
        if let Some(handle) = removed {
            if let Some(monitor) = handle.monitor {
                let _ = monitor.shutdown().await;
            }
        }
    }

    /// Drains every entry on process shutdown, stopping each monitor.
    pub async fn shutdown_all(&self) {
        let handles: Vec<ProjectHandle<M>> = {
            let mut projects = self.projects.lock().await;
            projects.drain().map(|(_, v)| v).collect()
        };
        for handle in handles {
            if let Some(monitor) = handle.monitor {
                let _ = monitor.shutdown().await;
            }
        }
    }

    pub async fn worker_manager_for(&self, project_dir: &Path) -> Option<Arc<WorkerManager<M>>> {
        let projects = self.projects.lock().await;
        projects.get(project_dir).map(|h| h.worker_manager.clone())
    }

    pub async fn store_for(&self, project_dir: &Path) -> Option<Arc<StateStore>> {
        let projects = self.projects.lock().await;
        projects.get(project_dir).map(|h| h.store.clone())
    }
}
