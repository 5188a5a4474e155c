use crate::progress::ProgressSink;
use crate::RuntimeError;
use berth_schema::{BuildRequest, ImageRef, MachineId, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Everything the runtime needs to build one machine's image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub workspace_id: WorkspaceId,
    pub machine: String,
    pub image: ImageRef,
    pub request: BuildRequest,
}

/// Link from a machine to an already created machine, visible under `alias`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineLink {
    pub target: MachineId,
    pub alias: String,
}

/// Everything the runtime needs to create one machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineSpec {
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub image: ImageRef,
    pub memory_limit: Option<u64>,
    pub memory_swap_limit: Option<i64>,
    pub env: BTreeMap<String, String>,
    pub links: Vec<MachineLink>,
}

/// Runtime-reported state of a machine found by the recovery probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LiveStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl LiveStatus {
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" | "up" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" | "stopped" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

impl fmt::Display for LiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One machine reported by [`MachineRuntime::list_live`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveMachine {
    pub machine_id: MachineId,
    pub display_name: String,
    pub status: LiveStatus,
}

/// Blocking interface to the container runtime.
///
/// Every call may block on I/O; callers bound them with their own timeouts.
pub trait MachineRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Build the image described by `spec.request` and tag it `spec.image`.
    fn build_image(
        &self,
        spec: &BuildSpec,
        progress: &dyn ProgressSink,
    ) -> Result<ImageRef, RuntimeError>;

    /// Create (but do not start) a machine, returning its runtime id.
    fn create(&self, spec: &MachineSpec) -> Result<MachineId, RuntimeError>;

    fn start(&self, id: &MachineId) -> Result<(), RuntimeError>;

    fn stop(&self, id: &MachineId) -> Result<(), RuntimeError>;

    /// Destroy a machine. The machine must not be running.
    fn remove(&self, id: &MachineId) -> Result<(), RuntimeError>;

    /// Recovery probe: every machine the runtime knows for `workspace`.
    fn list_live(&self, workspace: &WorkspaceId) -> Result<Vec<LiveMachine>, RuntimeError>;
}

pub fn select_runtime(name: &str) -> Result<Arc<dyn MachineRuntime>, RuntimeError> {
    match name {
        "docker" => Ok(Arc::new(crate::docker::DockerCliRuntime::new())),
        "podman" => Ok(Arc::new(crate::docker::DockerCliRuntime::with_binary(
            "podman",
        ))),
        "mock" => Ok(Arc::new(crate::mock::MockRuntime::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
