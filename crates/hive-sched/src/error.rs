use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("store error: {0}")]
    Store(#[from] hive_store::StoreError),

    #[error("health error: {0}")]
    Health(#[from] hive_health::HealthError),
}
