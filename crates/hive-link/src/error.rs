use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("operation timed out after {0}s")]
    Timeout(u64),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("copy failed: {0}")]
    CopyFailed(String),
}

impl LinkError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        LinkError::Io {
            context: context.into(),
            source,
        }
    }
}
