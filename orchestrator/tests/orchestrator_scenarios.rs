//! End-to-end scenarios exercising the operations layer against a
//! `FakeMultiplexer`, covering the happy path, dependency refusal, retry
//! budgets, the command allow-list, and crash recovery via the monitor.

use std::sync::Arc;

use orchestrator_core::model::WorkerRunState;
use orchestrator_core::ops::{
    CheckAllWorkersRequest, FeatureSpec, MarkCompleteRequest, OrchestratorInitRequest, OrchestratorStatusRequest,
    RetryFeatureRequest, RunVerificationRequest, StartWorkerRequest,
};
use orchestrator_core::{FakeMultiplexer, OrchestratorConfig, OrchestratorService, Registry, SessionStatus};

fn service(agent_bin: &str) -> (tempfile::TempDir, OrchestratorService<FakeMultiplexer>) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = OrchestratorConfig::default();
    config.agent_bin = agent_bin.to_string();
    let registry = Arc::new(Registry::new(config.clone(), Arc::new(FakeMultiplexer::default)));
    (dir, OrchestratorService::new(config, registry))
}

fn project_dir(dir: &tempfile::TempDir) -> String {
    dir.path().display().to_string()
}

async fn init_two_dependent_features(svc: &OrchestratorService<FakeMultiplexer>, project_dir: &str) {
    svc.orchestrator_init(OrchestratorInitRequest {
        project_dir: project_dir.to_string(),
        task: "ship the thing".to_string(),
        features: vec![
            FeatureSpec {
                id: "feat-1".to_string(),
                description: "first".to_string(),
                depends_on: None,
            },
            FeatureSpec {
                id: "feat-2".to_string(),
                description: "second".to_string(),
                depends_on: Some(vec!["feat-1".to_string()]),
            },
        ],
    })
    .await
    .unwrap();
}

// Scenario A: happy path, two features with a dependency, both completed in order.
#[tokio::test]
async fn scenario_a_happy_path() {
    let (dir, svc) = service("fake-agent");
    let project_dir = project_dir(&dir);
    init_two_dependent_features(&svc, &project_dir).await;

    let start = svc
        .start_worker(StartWorkerRequest {
            project_dir: project_dir.clone(),
            feature_id: "feat-1".to_string(),
            prompt: "do feat-1".to_string(),
        })
        .await
        .unwrap();

    std::fs::write(
        dir.path().join(".claude").join("orchestrator").join("workers").join(format!("{}.done", start.session_name)),
        b"",
    )
    .unwrap();

    let complete = svc
        .mark_complete(MarkCompleteRequest {
            project_dir: project_dir.clone(),
            feature_id: "feat-1".to_string(),
            success: true,
            notes: None,
        })
        .await
        .unwrap();
    assert_eq!(complete.status, orchestrator_core::FeatureStatus::Completed);

    let start2 = svc
        .start_worker(StartWorkerRequest {
            project_dir: project_dir.clone(),
            feature_id: "feat-2".to_string(),
            prompt: "do feat-2".to_string(),
        })
        .await
        .unwrap();
    std::fs::write(
        dir.path().join(".claude").join("orchestrator").join("workers").join(format!("{}.done", start2.session_name)),
        b"",
    )
    .unwrap();
    svc.mark_complete(MarkCompleteRequest {
        project_dir: project_dir.clone(),
        feature_id: "feat-2".to_string(),
        success: true,
        notes: None,
    })
    .await
    .unwrap();

    let status = svc
        .orchestrator_status(OrchestratorStatusRequest {
            project_dir,
            include_features: None,
            max_features: None,
        })
        .await
        .unwrap();
    assert_eq!(status.status, SessionStatus::Completed);
}

// Scenario B: starting a feature before its dependency is completed is refused,
// and leaves no state behind.
#[tokio::test]
async fn scenario_b_dependency_refusal() {
    let (dir, svc) = service("fake-agent");
    let project_dir = project_dir(&dir);
    init_two_dependent_features(&svc, &project_dir).await;

    let err = svc
        .start_worker(StartWorkerRequest {
            project_dir: project_dir.clone(),
            feature_id: "feat-2".to_string(),
            prompt: "jump the queue".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, orchestrator_core::OrchestratorError::UnmetDependency { .. }));

    let status = svc
        .orchestrator_status(OrchestratorStatusRequest {
            project_dir,
            include_features: Some(true),
            max_features: None,
        })
        .await
        .unwrap();
    let feat2 = status.features.iter().find(|f| f.id == "feat-2").unwrap();
    assert_eq!(feat2.status, orchestrator_core::FeatureStatus::Pending);
    assert!(status.summary.in_progress == 0 || status.features.iter().all(|f| f.id != "feat-2" || f.attempts == 0));
}

// Scenario C: a failure within the retry budget returns the feature to pending
// with its retry count bumped, and a subsequent success still completes the
// session.
#[tokio::test]
async fn scenario_c_retry_within_budget() {
    let (dir, svc) = service("fake-agent");
    let project_dir = project_dir(&dir);
    svc.orchestrator_init(OrchestratorInitRequest {
        project_dir: project_dir.clone(),
        task: "one feature".to_string(),
        features: vec![FeatureSpec {
            id: "feat-1".to_string(),
            description: "first".to_string(),
            depends_on: None,
        }],
    })
    .await
    .unwrap();

    svc.start_worker(StartWorkerRequest {
        project_dir: project_dir.clone(),
        feature_id: "feat-1".to_string(),
        prompt: "attempt one".to_string(),
    })
    .await
    .unwrap();

    let failed = svc
        .mark_complete(MarkCompleteRequest {
            project_dir: project_dir.clone(),
            feature_id: "feat-1".to_string(),
            success: false,
            notes: Some("oom".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(failed.status, orchestrator_core::FeatureStatus::Pending);

    let start2 = svc
        .start_worker(StartWorkerRequest {
            project_dir: project_dir.clone(),
            feature_id: "feat-1".to_string(),
            prompt: "attempt two".to_string(),
        })
        .await
        .unwrap();
    std::fs::write(
        dir.path().join(".claude").join("orchestrator").join("workers").join(format!("{}.done", start2.session_name)),
        b"",
    )
    .unwrap();
    svc.mark_complete(MarkCompleteRequest {
        project_dir: project_dir.clone(),
        feature_id: "feat-1".to_string(),
        success: true,
        notes: None,
    })
    .await
    .unwrap();

    let status = svc
        .orchestrator_status(OrchestratorStatusRequest {
            project_dir,
            include_features: None,
            max_features: None,
        })
        .await
        .unwrap();
    assert_eq!(status.status, SessionStatus::Completed);
}

// Scenario D: exhausting the retry budget leaves the feature permanently
// failed until an explicit retry_feature resets it.
#[tokio::test]
async fn scenario_d_retry_exhausted() {
    let (dir, svc) = service("fake-agent");
    let project_dir = project_dir(&dir);
    svc.orchestrator_init(OrchestratorInitRequest {
        project_dir: project_dir.clone(),
        task: "one feature".to_string(),
        features: vec![FeatureSpec {
            id: "feat-1".to_string(),
            description: "flaky".to_string(),
            depends_on: None,
        }],
    })
    .await
    .unwrap();

    // Lower the retry budget by going through add_feature's validation path
    // is not available here; instead drive two failures against the default
    // budget of 3, then directly exhaust via a crafted low-budget feature.
    svc.start_worker(StartWorkerRequest {
        project_dir: project_dir.clone(),
        feature_id: "feat-1".to_string(),
        prompt: "attempt one".to_string(),
    })
    .await
    .unwrap();
    svc.mark_complete(MarkCompleteRequest {
        project_dir: project_dir.clone(),
        feature_id: "feat-1".to_string(),
        success: false,
        notes: Some("err1".to_string()),
    })
    .await
    .unwrap();

    svc.start_worker(StartWorkerRequest {
        project_dir: project_dir.clone(),
        feature_id: "feat-1".to_string(),
        prompt: "attempt two".to_string(),
    })
    .await
    .unwrap();
    svc.mark_complete(MarkCompleteRequest {
        project_dir: project_dir.clone(),
        feature_id: "feat-1".to_string(),
        success: false,
        notes: Some("err2".to_string()),
    })
    .await
    .unwrap();

    svc.start_worker(StartWorkerRequest {
        project_dir: project_dir.clone(),
        feature_id: "feat-1".to_string(),
        prompt: "attempt three".to_string(),
    })
    .await
    .unwrap();
    let third = svc
        .mark_complete(MarkCompleteRequest {
            project_dir: project_dir.clone(),
            feature_id: "feat-1".to_string(),
            success: false,
            notes: Some("err3".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(third.status, orchestrator_core::FeatureStatus::Failed);

    let blocked = svc
        .start_worker(StartWorkerRequest {
            project_dir: project_dir.clone(),
            feature_id: "feat-1".to_string(),
            prompt: "attempt four".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        blocked,
        orchestrator_core::OrchestratorError::RetryBudgetExhausted { .. }
    ));

    svc.retry_feature(RetryFeatureRequest {
        project_dir: project_dir.clone(),
        feature_id: "feat-1".to_string(),
    })
    .await
    .unwrap();

    svc.start_worker(StartWorkerRequest {
        project_dir,
        feature_id: "feat-1".to_string(),
        prompt: "attempt five".to_string(),
    })
    .await
    .unwrap();
}

// Scenario E: the command allow-list rejects a disallowed command without
// spawning a process, and accepts an allowed one.
#[tokio::test]
async fn scenario_e_command_allow_list() {
    let (dir, svc) = service("fake-agent");
    let project_dir = project_dir(&dir);
    svc.orchestrator_init(OrchestratorInitRequest {
        project_dir: project_dir.clone(),
        task: "verify".to_string(),
        features: vec![],
    })
    .await
    .unwrap();

    let report = svc
        .run_verification(RunVerificationRequest {
            project_dir: project_dir.clone(),
            feature_id: None,
            commands: Some(vec!["rm -rf /".to_string()]),
            fail_on_error: Some(false),
            timeout_secs: None,
        })
        .await
        .unwrap()
        .report;
    assert!(!report.passed);
    assert!(!report.results[0].passed);

    let report = svc
        .run_verification(RunVerificationRequest {
            project_dir,
            feature_id: None,
            commands: Some(vec!["git status".to_string()]),
            fail_on_error: Some(false),
            timeout_secs: None,
        })
        .await
        .unwrap()
        .report;
    assert!(report.results[0].output.len() <= 1024 * 1024);
}

// Scenario F: after a restart, the monitor re-evaluates every `running`
// worker on its next tick based solely on filesystem state.
#[tokio::test]
async fn scenario_f_crash_recovery_via_monitor() {
    let (dir, svc) = service("fake-agent");
    let project_dir = project_dir(&dir);
    svc.orchestrator_init(OrchestratorInitRequest {
        project_dir: project_dir.clone(),
        task: "one feature".to_string(),
        features: vec![FeatureSpec {
            id: "feat-1".to_string(),
            description: "first".to_string(),
            depends_on: None,
        }],
    })
    .await
    .unwrap();

    let start = svc
        .start_worker(StartWorkerRequest {
            project_dir: project_dir.clone(),
            feature_id: "feat-1".to_string(),
            prompt: "go".to_string(),
        })
        .await
        .unwrap();
    std::fs::write(
        dir.path().join(".claude").join("orchestrator").join("workers").join(format!("{}.done", start.session_name)),
        b"",
    )
    .unwrap();

    // Simulate "restart": a fresh registry lazily adopts the on-disk state.
    let mut config = OrchestratorConfig::default();
    config.agent_bin = "fake-agent".to_string();
    let fresh_registry = Arc::new(Registry::new(config.clone(), Arc::new(FakeMultiplexer::default)));
    let fresh_svc = OrchestratorService::new(config, fresh_registry);

    // The first call that adopts the project spawns its monitor; give the
    // monitor's first tick (which fires immediately) a moment to run before
    // reading worker state back out.
    let workers = fresh_svc
        .check_all_workers(CheckAllWorkersRequest {
            project_dir: project_dir.clone(),
        })
        .await
        .unwrap();
    assert_eq!(workers.workers.len(), 1);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let workers = fresh_svc
        .check_all_workers(CheckAllWorkersRequest {
            project_dir: project_dir.clone(),
        })
        .await
        .unwrap();
    assert_eq!(workers.workers[0].heartbeat.status, WorkerRunState::Completed);

    let status = fresh_svc
        .orchestrator_status(OrchestratorStatusRequest {
            project_dir,
            include_features: None,
            max_features: None,
        })
        .await
        .unwrap();
    // Feature state is untouched by the monitor; it is still in_progress
    // until an explicit mark_complete acknowledges the done marker.
    assert_eq!(status.status, SessionStatus::InProgress);
}
