//! Container runtime access for Berth environments.
//!
//! This crate implements the execution layer: the blocking `MachineRuntime`
//! trait, a Docker-CLI-driven implementation (also usable with podman), an
//! in-memory mock with failure injection for tests, build progress sinks, and
//! prerequisite checks for the host.

pub mod backend;
pub mod docker;
pub mod mock;
pub mod prereq;
pub mod progress;

pub use backend::{
    select_runtime, BuildSpec, LiveMachine, LiveStatus, MachineLink, MachineRuntime, MachineSpec,
};
pub use docker::DockerCliRuntime;
pub use mock::{MockCall, MockOp, MockRuntime};
pub use prereq::{check_docker_prereqs, format_missing, MissingPrereq};
pub use progress::{CollectProgress, NoProgress, ProgressSink, TracingProgress};

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("runtime '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("cannot reach the container daemon: {0}")]
    Daemon(String),
    #[error("'{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("failed to build image '{image}': {detail}")]
    BuildFailed { image: String, detail: String },
    #[error("machine not found: {0}")]
    MachineNotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("unexpected runtime output: {0}")]
    InvalidOutput(String),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
}

impl RuntimeError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Daemon(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RuntimeError::Daemon("down".into()).is_transient());
        assert!(RuntimeError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")).is_transient());
        assert!(!RuntimeError::Io(io::Error::new(io::ErrorKind::NotFound, "gone")).is_transient());
        assert!(!RuntimeError::MachineNotFound("x".into()).is_transient());
        assert!(!RuntimeError::BuildFailed {
            image: "a".into(),
            detail: "b".into()
        }
        .is_transient());
    }
}
