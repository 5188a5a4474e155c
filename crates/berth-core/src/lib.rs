//! Core orchestration engine for Berth workspace environments.
//!
//! This crate ties together the schema layer and the container runtime into
//! `EnvironmentEngine`s: starting a workspace's machines in dependency order
//! with bounded parallelism, recovering machines left running by an earlier
//! process, and tearing everything down again. It also provides the
//! per-workspace `Registry`, the machine status state machine, cancellation
//! and timeout helpers, engine dispatch by environment type, and the engine
//! configuration file.

pub mod concurrency;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod lifecycle;
pub mod machine;
pub mod registry;

pub use concurrency::{
    install_signal_handler, run_tracked, run_with_timeout, shutdown_requested, CallFailed,
    CancelToken, LateCall,
};
pub use config::EngineConfig;
pub use dispatch::EngineDispatcher;
pub use engine::{ContainerEngine, EnvironmentEngine};
pub use lifecycle::validate_transition;
pub use machine::{Machine, MachineStatus};
pub use registry::{Registry, RegistryEntry, SlotGuard, WorkspaceSlot};

use std::fmt::Write as _;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("manifest error: {0}")]
    Manifest(#[from] berth_schema::ManifestError),
    #[error("invalid environment: {0}")]
    Validation(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] berth_runtime::RuntimeError),
    #[error("{op} of '{machine}' failed: {source}")]
    Machine {
        machine: String,
        op: &'static str,
        #[source]
        source: berth_runtime::RuntimeError,
    },
    #[error("{op} of '{target}' timed out after {}s", .after.as_secs())]
    Timeout {
        op: &'static str,
        target: String,
        after: Duration,
    },
    #[error("start cancelled")]
    Cancelled,
    #[error("workspace '{0}' already has a running environment")]
    AlreadyRunning(String),
    #[error("failed to stop workspace '{workspace}':{}", format_failures(.failures))]
    StopFailed {
        workspace: String,
        failures: Vec<(String, String)>,
    },
    #[error("no engine registered for environment type '{0}'")]
    UnknownEngineType(String),
    #[error("invalid machine status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("{op} of '{target}' ended without a result")]
    WorkerLost { op: &'static str, target: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The caller supplied something unusable; retrying unchanged cannot help.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Manifest(_) | Self::Validation(_) | Self::UnknownEngineType(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The container runtime refused or failed an operation.
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Self::Runtime(_) | Self::Machine { .. } | Self::StopFailed { .. }
        )
    }
}

fn format_failures(failures: &[(String, String)]) -> String {
    let mut out = String::new();
    for (machine, cause) in failures {
        let _ = write!(out, "\n  {machine}: {cause}");
    }
    out
}
