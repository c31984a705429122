pub mod error;
pub mod event;
pub mod payload;
pub mod types;

pub use error::DomainError;
pub use event::{Event, EventKind, ProbeResult, ProtocolEntry};
pub use payload::{
    DeployAction, DeployLogEntry, DeployOutcome, DronePayload, PayloadKind, PayloadVersion,
    Release, ReleaseStatus,
};
pub use types::{
    epoch_to_utc, utc_to_epoch, AssignResult, BuildRecord, Capabilities, CompletionReport,
    CompletionResult, CompletionStatus, ControlAction, Drone, DroneConfig, DroneId, DroneKind,
    DroneRole, HealthRecord, Metrics, QueueItem, QueueStatus, Registration, RejectReason,
    Session, SessionStatus,
};
