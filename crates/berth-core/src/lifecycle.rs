use crate::CoreError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Configuring,
    Running,
    Suspended,
    Destroyed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Configuring => write!(f, "configuring"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Suspended => write!(f, "suspended"),
            ContainerState::Destroyed => write!(f, "destroyed"),
        }
    }
}

pub fn validate_transition(from: ContainerState, to: ContainerState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            ContainerState::Created | ContainerState::Configuring,
            ContainerState::Configuring | ContainerState::Running
        ) | (
            ContainerState::Running,
            ContainerState::Configuring | ContainerState::Suspended
        ) | (ContainerState::Suspended, ContainerState::Running)
            | (
                ContainerState::Created
                    | ContainerState::Configuring
                    | ContainerState::Running
                    | ContainerState::Suspended,
                ContainerState::Destroyed
            )
    );

    if valid {
        Ok(())
    } else {
        Err(invalid_transition(from, to))
    }
}

pub(crate) fn invalid_transition(from: ContainerState, to: ContainerState) -> CoreError {
    CoreError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}
