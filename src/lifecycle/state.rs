use std::fmt;

use serde::Serialize;

/// Install status of one model on the backend host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Idle,
    Checking,
    AwaitingUserConfirmation,
    Downloading,
    Downloaded,
    Canceling,
    Error,
}

impl ModelStatus {
    /// A remote call or poll loop owns the model in these states.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ModelStatus::Checking | ModelStatus::Downloading | ModelStatus::Canceling)
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModelStatus::Idle => "idle",
            ModelStatus::Checking => "checking",
            ModelStatus::AwaitingUserConfirmation => "not installed",
            ModelStatus::Downloading => "downloading",
            ModelStatus::Downloaded => "downloaded",
            ModelStatus::Canceling => "canceling",
            ModelStatus::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Check,
    CheckCompleted { installed: bool },
    Confirm,
    Decline,
    PollInstalled,
    Failed,
    Cancel,
    CancelCompleted,
    Deleted,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Event::Check => "check",
            Event::CheckCompleted { .. } => "finish checking",
            Event::Confirm => "pull",
            Event::Decline => "decline pulling",
            Event::PollInstalled => "finish pulling",
            Event::Failed => "fail",
            Event::Cancel => "cancel",
            Event::CancelCompleted => "finish canceling",
            Event::Deleted => "delete",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot {event} while {from}")]
pub struct TransitionError {
    pub from: ModelStatus,
    pub event: Event,
}

/// The lifecycle state machine. Downloaded and Error are terminal until the
/// model is selected again, which issues a fresh `Check`.
pub fn transition(from: ModelStatus, event: Event) -> Result<ModelStatus, TransitionError> {
    use ModelStatus::*;

    let to = match (from, event) {
        (Idle | Downloaded | Error | AwaitingUserConfirmation, Event::Check) => Checking,
        (Checking, Event::CheckCompleted { installed: true }) => Downloaded,
        (Checking, Event::CheckCompleted { installed: false }) => AwaitingUserConfirmation,
        (AwaitingUserConfirmation, Event::Confirm) => Downloading,
        (AwaitingUserConfirmation, Event::Decline) => Idle,
        (Downloading, Event::PollInstalled) => Downloaded,
        (Checking | Downloading, Event::Failed) => Error,
        (Downloading, Event::Cancel) => Canceling,
        (Canceling, Event::CancelCompleted) => Idle,
        (Downloaded, Event::Deleted) => Idle,
        _ => return Err(TransitionError { from, event }),
    };
    Ok(to)
}
