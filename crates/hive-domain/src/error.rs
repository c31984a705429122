use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid drone kind: {0}")]
    InvalidDroneKind(String),

    #[error("invalid queue status: {0}")]
    InvalidQueueStatus(String),

    #[error("invalid completion status: {0}")]
    InvalidCompletionStatus(String),

    #[error("invalid control action: {0}")]
    InvalidControlAction(String),

    #[error("invalid event kind: {0}")]
    InvalidEventKind(String),

    #[error("invalid payload kind: {0}")]
    InvalidPayloadKind(String),

    #[error("invalid release status: {0}")]
    InvalidReleaseStatus(String),

    #[error("invalid release transition: {from} -> {to}")]
    InvalidReleaseTransition { from: String, to: String },
}
