//! Scheduler & retry policy (spec §4.5) and dependency-cycle detection
//! (spec §4.5.1), grounded in the teacher's `FeatureRegistry` DFS helpers.

use std::collections::HashSet;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{Feature, FeatureStatus, Session};

/// Admits iff the feature is `pending`, every `depends_on` entry is
/// `completed`, and `attempts < max_retries`.
pub fn check_admission(session: &Session, feature_id: &str) -> OrchestratorResult<()> {
    let feature = session
        .find_feature(feature_id)
        .ok_or_else(|| OrchestratorError::UnknownFeature {
            feature_id: feature_id.to_string(),
        })?;

    if !matches!(feature.status, FeatureStatus::Pending) {
        return Err(OrchestratorError::InvalidTransition {
            from: format!("{:?}", feature.status),
            to: "in_progress".to_string(),
            reason: "feature is not pending".to_string(),
        });
    }

    if feature.is_retry_budget_exhausted() {
        return Err(OrchestratorError::RetryBudgetExhausted {
            feature_id: feature_id.to_string(),
            attempts: feature.attempts,
            max_retries: feature.max_retries,
        });
    }

    for dep_id in &feature.depends_on {
        match session.find_feature(dep_id) {
            Some(dep) if matches!(dep.status, FeatureStatus::Completed) => {}
            _ => {
                return Err(OrchestratorError::UnmetDependency {
                    feature_id: feature_id.to_string(),
                    missing_dependency: dep_id.clone(),
                })
            }
        }
    }
    Ok(())
}

/// Validates a whole batch before any worker is spawned: reports the first
/// of {unknown id, non-pending, unmet dependency, duplicate}.
pub fn validate_workers(session: &Session, feature_ids: &[String]) -> OrchestratorResult<()> {
    let mut seen = HashSet::new();
    for id in feature_ids {
        if !seen.insert(id.clone()) {
            return Err(OrchestratorError::invalid_input(format!(
                "duplicate feature id in batch: {id}"
            )));
        }
        check_admission(session, id)?;
    }
    let in_progress_count = session
        .features
        .iter()
        .filter(|f| matches!(f.status, FeatureStatus::InProgress))
        .count();
    if in_progress_count + feature_ids.len() > crate::model::DEFAULT_MAX_CONCURRENT_WORKERS {
        return Err(OrchestratorError::Concurrency {
            detail: format!(
                "starting {} workers would exceed the concurrency cap of {}",
                feature_ids.len(),
                crate::model::DEFAULT_MAX_CONCURRENT_WORKERS
            ),
        });
    }
    Ok(())
}

/// Outcome of `mark_complete(success=false)`.
pub enum RetryOutcome {
    /// Reset to pending; caller should kill the associated worker session.
    Retried { attempts: u32 },
    /// Retry budget exhausted; feature is now terminally failed.
    Exhausted { attempts: u32 },
}

/// Applies the retry policy in place and returns what happened. Does not
/// touch WorkerStatus — callers compose with the worker manager to kill the
/// session.
pub fn apply_retry_policy(feature: &mut Feature, last_error: Option<String>) -> RetryOutcome {
    feature.last_error = last_error;
    if feature.attempts < feature.max_retries {
        feature.status = FeatureStatus::Pending;
        feature.worker_id = None;
        RetryOutcome::Retried {
            attempts: feature.attempts,
        }
    } else {
        feature.status = FeatureStatus::Failed;
        RetryOutcome::Exhausted {
            attempts: feature.attempts,
        }
    }
}

/// DFS cycle detection over the full `depends_on` graph. Returns the ids
/// that participate in a cycle, if any.
pub fn detect_cycles(features: &[Feature]) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InStack,
        Done,
    }

    fn visit(
        id: &str,
        features: &[Feature],
        marks: &mut std::collections::HashMap<String, Mark>,
        cyclic: &mut HashSet<String>,
    ) {
        match marks.get(id) {
            Some(Mark::InStack) => {
                cyclic.insert(id.to_string());
                return;
            }
            Some(Mark::Done) => return,
            _ => {}
        }
        marks.insert(id.to_string(), Mark::InStack);
        if let Some(feature) = features.iter().find(|f| f.id == id) {
            for dep in &feature.depends_on {
                visit(dep, features, marks, cyclic);
                if cyclic.contains(dep) {
                    cyclic.insert(id.to_string());
                }
            }
        }
        marks.insert(id.to_string(), Mark::Done);
    }

    let mut marks = std::collections::HashMap::new();
    let mut cyclic = HashSet::new();
    for feature in features {
        visit(&feature.id, features, &mut marks, &mut cyclic);
    }
    let mut result: Vec<String> = cyclic.into_iter().collect();
    result.sort();
    result
}

/// Validates that `dependsOn` refers only to existing ids and introduces
/// no cycle, as required before `add_feature`/`set_dependencies` commit.
pub fn validate_dependency_set(
    session: &Session,
    feature_id: &str,
    depends_on: &[String],
) -> OrchestratorResult<()> {
    for dep in depends_on {
        if dep == feature_id {
            return Err(OrchestratorError::invalid_input(format!(
                "feature {feature_id} cannot depend on itself"
            )));
        }
        if session.find_feature(dep).is_none() {
            return Err(OrchestratorError::invalid_input(format!(
                "unknown dependency id: {dep}"
            )));
        }
    }

    let mut projected: Vec<Feature> = session.features.clone();
    if let Some(f) = projected.iter_mut().find(|f| f.id == feature_id) {
        f.depends_on = depends_on.to_vec();
    }
    let cycles = detect_cycles(&projected);
    if !cycles.is_empty() {
        return Err(OrchestratorError::invalid_input(format!(
            "dependency cycle detected involving: {}",
            cycles.join(", ")
        )));
    }
    Ok(())
}

/// Topological collection of `feature_id`'s transitive dependencies,
/// excluding itself — used to explain why a feature is blocked.
pub fn dependency_chain(features: &[Feature], feature_id: &str) -> Vec<String> {
    fn visit(id: &str, features: &[Feature], seen: &mut HashSet<String>, out: &mut Vec<String>) {
        if !seen.insert(id.to_string()) {
            return;
        }
        if let Some(feature) = features.iter().find(|f| f.id == id) {
            for dep in &feature.depends_on {
                visit(dep, features, seen, out);
                if !out.contains(dep) {
                    out.push(dep.clone());
                }
            }
        }
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    visit(feature_id, features, &mut seen, &mut out);
    out.retain(|id| id != feature_id);
    out
}
