use crate::lifecycle::validate_transition;
use crate::EngineError;
use berth_schema::{ImageRef, MachineId, WorkspaceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl MachineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A running (or recently running) instance of one machine of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub display_name: String,
    pub workspace_id: WorkspaceId,
    /// Unknown for machines reattached by the recovery probe.
    pub image: Option<ImageRef>,
    pub status: MachineStatus,
    pub started_at: DateTime<Utc>,
}

impl Machine {
    pub fn new(
        id: MachineId,
        display_name: impl Into<String>,
        workspace_id: WorkspaceId,
        image: Option<ImageRef>,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            workspace_id,
            image,
            status: MachineStatus::Starting,
            started_at: Utc::now(),
        }
    }

    /// A machine found already running by the recovery probe.
    pub fn recovered(id: MachineId, display_name: impl Into<String>, workspace_id: WorkspaceId) -> Self {
        Self {
            status: MachineStatus::Running,
            ..Self::new(id, display_name, workspace_id, None)
        }
    }

    pub fn transition(&mut self, to: MachineStatus) -> Result<(), EngineError> {
        validate_transition(self.status, to)?;
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Machine {
        Machine::new(
            MachineId::new("m1"),
            "db",
            WorkspaceId::new("ws1"),
            Some(ImageRef::new("postgres:16")),
        )
    }

    #[test]
    fn new_machine_is_starting() {
        let m = machine();
        assert_eq!(m.status, MachineStatus::Starting);
        assert!(!m.status.is_terminal());
    }

    #[test]
    fn forward_transitions_apply() {
        let mut m = machine();
        m.transition(MachineStatus::Running).unwrap();
        m.transition(MachineStatus::Stopping).unwrap();
        m.transition(MachineStatus::Stopped).unwrap();
        assert!(m.status.is_terminal());
        assert!(m.transition(MachineStatus::Running).is_err());
        assert_eq!(m.status, MachineStatus::Stopped);
    }

    #[test]
    fn recovered_machine_is_running_without_image() {
        let m = Machine::recovered(MachineId::new("x"), "app", WorkspaceId::new("ws1"));
        assert_eq!(m.status, MachineStatus::Running);
        assert!(m.image.is_none());
    }

    #[test]
    fn serializes_status_lowercase() {
        let json = serde_json::to_value(machine()).unwrap();
        assert_eq!(json["status"], "starting");
        assert_eq!(json["display_name"], "db");
        assert!(json["started_at"].as_str().is_some());
    }
}
