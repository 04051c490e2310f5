//! Supervised completion-monitor task (spec §4.4, §4.4.1).
//!
//! One monitor task runs per active session, polling worker `.done` markers
//! and live-session presence on a fixed tick. Grounded in the teacher's
//! `verifier::pipeline` timeout discipline, generalized here to a
//! long-lived background task rather than a single bounded subprocess, and
//! in the `tokio::sync::watch` shutdown-channel idiom used throughout the
//! teacher's harness startup path.
//!
//! The monitor never advances Feature state — only WorkerStatus. Feature
//! advancement happens in `ops::mark_complete`, which reads these signals.
//! This keeps a crash or a successful exit from consuming retry budget or
//! declaring success without an explicit client acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::model::{Session, WorkerRunState};
use crate::store::StateStore;
use crate::worker::{SessionMultiplexer, WorkerManager};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Handle to a running monitor task. Dropping this without calling
/// `shutdown` leaves the task running; `shutdown` is the only sanctioned
/// way to stop it.
pub struct Monitor {
    shutdown_tx: watch::Sender<bool>,
    join_handle: tokio::task::JoinHandle<()>,
}

impl Monitor {
    /// Spawns the completion-monitor loop for a single session directory.
    /// `session_mutex` must be the same mutex the rest of the process uses
    /// to guard this session's state (spec §5.1) — the monitor never reads
    /// or writes state outside that lock.
    pub fn spawn<M: SessionMultiplexer + 'static>(
        store: Arc<StateStore>,
        worker_manager: Arc<WorkerManager<M>>,
        session_mutex: Arc<Mutex<Session>>,
    ) -> Self {
        Self::spawn_with_interval(store, worker_manager, session_mutex, POLL_INTERVAL)
    }

    pub fn spawn_with_interval<M: SessionMultiplexer + 'static>(
        store: Arc<StateStore>,
        worker_manager: Arc<WorkerManager<M>>,
        session_mutex: Arc<Mutex<Session>>,
        tick_interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join_handle = tokio::spawn(async move {
            let mut consecutive_errors: u32 = 0;
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                // Mutual exclusion between ticks is implicit: we only ever
                // await the next tick after the previous run_once future
                // has resolved, so overlapping invocations cannot occur.
                match run_once(&store, &worker_manager, &session_mutex).await {
                    Ok(()) => consecutive_errors = 0,
                    Err(e) => {
                        consecutive_errors += 1;
                        tracing::warn!(error = %e, consecutive_errors, "monitor tick failed");
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            tracing::error!(
                                consecutive_errors,
                                "monitor self-protection tripped: stopping after repeated failures"
                            );
                            break;
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            join_handle,
        }
    }

    /// Sends the shutdown signal and returns the join handle for the
    /// caller to `.await` explicitly — never a detached fire-and-forget.
    pub fn shutdown(self) -> tokio::task::JoinHandle<()> {
        let _ = self.shutdown_tx.send(true);
        self.join_handle
    }
}

/// One polling pass: for every `running` worker, checks the done marker and
/// live-session presence, updating only WorkerStatus.
async fn run_once<M: SessionMultiplexer>(
    store: &StateStore,
    worker_manager: &WorkerManager<M>,
    session_mutex: &Mutex<Session>,
) -> crate::error::OrchestratorResult<()> {
    let mut session = session_mutex.lock().await;

    let running: Vec<String> = session
        .workers
        .iter()
        .filter(|w| matches!(w.status, WorkerRunState::Running))
        .map(|w| w.session_name.clone())
        .collect();

    let mut dirty = false;
    for session_name in running {
        if worker_manager.has_done_marker(&session_name) {
            set_worker_status(&mut session, &session_name, WorkerRunState::Completed);
            session.push_log(format!("worker {session_name} signalled completion"));
            dirty = true;
        } else if !worker_manager.has_live_session(&session_name) {
            set_worker_status(&mut session, &session_name, WorkerRunState::Crashed);
            session.push_log(format!("worker {session_name} exited without signalling completion"));
            dirty = true;
        } else {
            touch_last_checked(&mut session, &session_name);
        }
    }

    if dirty {
        store.save(&mut session)?;
    }
    Ok(())
}

fn set_worker_status(session: &mut Session, session_name: &str, status: WorkerRunState) {
    if let Some(worker) = session
        .workers
        .iter_mut()
        .find(|w| w.session_name == session_name)
    {
        worker.status = status;
        worker.last_checked = chrono::Utc::now();
    }
}

fn touch_last_checked(session: &mut Session, session_name: &str) {
    if let Some(worker) = session
        .workers
        .iter_mut()
        .find(|w| w.session_name == session_name)
    {
        worker.last_checked = chrono::Utc::now();
    }
}
