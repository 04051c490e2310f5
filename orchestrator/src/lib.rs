//! Orchestrator core: a supervisor engine for fleets of coding-agent worker
//! processes.
//!
//! The crate owns durable session/feature state, worker lifecycle
//! (spawn/message/check/kill via a terminal multiplexer), a completion
//! monitor, a dependency-aware scheduler with a bounded retry policy, an
//! allow-listed verification runner, and git checkpointing — exposed
//! through a small set of validated operations in [`ops`].

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod error;
pub mod git;
pub mod model;
pub mod monitor;
pub mod ops;
pub mod registry;
pub mod scheduler;
pub mod security;
pub mod store;
pub mod verify;
pub mod worker;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, OrchestratorResult, StructuredError};
pub use model::{Feature, FeatureStatus, Session, SessionStatus, WorkerStatus};
pub use ops::OrchestratorService;
pub use registry::Registry;
pub use worker::{FakeMultiplexer, SessionMultiplexer, TmuxMultiplexer, WorkerManager};
