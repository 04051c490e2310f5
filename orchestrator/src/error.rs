//! Error taxonomy for the orchestrator core and its RPC-boundary projection.
//!
//! Mirrors the distinction the harness layer this crate grew out of drew
//! between throw-style internal propagation and an explicit result variant
//! at every public boundary: `OrchestratorError` is the internal type,
//! `StructuredError` is what callers actually see.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("state corruption at {path}: {message}")]
    StateCorruption { path: String, message: String },

    #[error("unknown feature: {feature_id}")]
    UnknownFeature { feature_id: String },

    #[error("unknown worker: {session_name}")]
    UnknownWorker { session_name: String },

    #[error("feature {feature_id} depends on unmet dependency {missing_dependency}")]
    UnmetDependency {
        feature_id: String,
        missing_dependency: String,
    },

    #[error("retry budget exhausted for {feature_id}: {attempts}/{max_retries} attempts")]
    RetryBudgetExhausted {
        feature_id: String,
        attempts: u32,
        max_retries: u32,
    },

    #[error("command not allowed: {command}")]
    CommandNotAllowed { command: String },

    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("subprocess failed with exit code {exit_code:?}: {command}")]
    SubprocessFailed {
        command: String,
        exit_code: Option<i32>,
    },

    #[error("filesystem error at {path}: {message}")]
    FilesystemError { path: String, message: String },

    #[error("concurrency limit exceeded: {detail}")]
    Concurrency { detail: String },

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn filesystem(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FilesystemError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether a caller can sensibly retry the *same* operation unmodified.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Timeout { .. }
                | OrchestratorError::SubprocessFailed { .. }
                | OrchestratorError::Concurrency { .. }
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidInput { .. } => "InvalidInput",
            OrchestratorError::StateCorruption { .. } => "StateCorruption",
            OrchestratorError::UnknownFeature { .. } => "UnknownFeature",
            OrchestratorError::UnknownWorker { .. } => "UnknownWorker",
            OrchestratorError::UnmetDependency { .. } => "UnmetDependency",
            OrchestratorError::RetryBudgetExhausted { .. } => "RetryBudgetExhausted",
            OrchestratorError::CommandNotAllowed { .. } => "CommandNotAllowed",
            OrchestratorError::Timeout { .. } => "Timeout",
            OrchestratorError::SubprocessFailed { .. } => "SubprocessFailed",
            OrchestratorError::FilesystemError { .. } => "FilesystemError",
            OrchestratorError::Concurrency { .. } => "Concurrency",
            OrchestratorError::InvalidTransition { .. } => "InvalidTransition",
            OrchestratorError::Io(_) => "FilesystemError",
            OrchestratorError::Json(_) => "StateCorruption",
        }
    }

    fn details(&self) -> Value {
        let mut map: HashMap<&'static str, Value> = HashMap::new();
        match self {
            OrchestratorError::UnmetDependency {
                feature_id,
                missing_dependency,
            } => {
                map.insert("feature_id", Value::String(feature_id.clone()));
                map.insert(
                    "missing_dependency",
                    Value::String(missing_dependency.clone()),
                );
            }
            OrchestratorError::RetryBudgetExhausted {
                feature_id,
                attempts,
                max_retries,
            } => {
                map.insert("feature_id", Value::String(feature_id.clone()));
                map.insert("attempts", Value::from(*attempts));
                map.insert("max_retries", Value::from(*max_retries));
            }
            OrchestratorError::CommandNotAllowed { command } => {
                map.insert("command", Value::String(command.clone()));
            }
            OrchestratorError::Timeout { seconds } => {
                map.insert("seconds", Value::from(*seconds));
            }
            OrchestratorError::FilesystemError { path, .. } => {
                map.insert("path", Value::String(path.clone()));
            }
            OrchestratorError::InvalidTransition { from, to, .. } => {
                map.insert("from", Value::String(from.clone()));
                map.insert("to", Value::String(to.clone()));
            }
            _ => {}
        }
        serde_json::to_value(map).unwrap_or(Value::Null)
    }

    pub fn to_structured(&self) -> StructuredError {
        StructuredError {
            kind: self.kind(),
            message: self.to_string(),
            details: self.details(),
            recoverable: self.is_recoverable(),
        }
    }
}

/// The `{kind, message, details?, recoverable}` object returned at every
/// operation boundary (spec §6, §7.1).
#[derive(Debug, Clone, Serialize)]
pub struct StructuredError {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
    pub recoverable: bool,
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
