use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("store error: {0}")]
    Store(#[from] hive_store::StoreError),

    #[error("link error: {0}")]
    Link(#[from] hive_link::LinkError),
}
