use crate::machine::MachineStatus;
use crate::EngineError;

pub fn validate_transition(from: MachineStatus, to: MachineStatus) -> Result<(), EngineError> {
    let valid = matches!(
        (from, to),
        (MachineStatus::Starting, MachineStatus::Running)
            | (MachineStatus::Running, MachineStatus::Stopping)
            | (MachineStatus::Stopping, MachineStatus::Stopped)
            | (
                MachineStatus::Starting | MachineStatus::Running | MachineStatus::Stopping,
                MachineStatus::Failed
            )
    );

    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
