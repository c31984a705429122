use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("store error: {0}")]
    Store(#[from] hive_store::StoreError),

    #[error("link error: {0}")]
    Link(#[from] hive_link::LinkError),

    #[error("payload not found: {kind} {version}")]
    NotFound { kind: String, version: String },

    #[error("drone not found: {0}")]
    DroneNotFound(String),

    #[error("no deployment recorded for {kind} on {drone}")]
    NothingDeployed { kind: String, drone: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PayloadError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        PayloadError::Io {
            path: path.into(),
            source,
        }
    }
}
