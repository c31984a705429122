use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("drone not found: {0}")]
    DroneNotFound(String),

    #[error("package not found in queue: {0}")]
    PackageNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("payload not found: {0} {1}")]
    PayloadNotFound(String, String),

    #[error("release not found: {0}")]
    ReleaseNotFound(String),

    #[error("duplicate payload version: {0} {1}")]
    DuplicatePayload(String, String),

    #[error("invalid release transition: {from} -> {to}")]
    InvalidReleaseTransition { from: String, to: String },

    #[error("rejected query: {0}")]
    RejectedQuery(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("domain error: {0}")]
    Domain(#[from] hive_domain::DomainError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
