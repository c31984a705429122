pub mod drone_config;
pub mod drones;
pub mod error;
pub mod events;
pub mod explorer;
pub mod health;
pub mod history;
pub mod payloads;
pub mod protocol;
pub mod queue;
pub mod releases;
pub mod sessions;
pub mod store;

pub use error::StoreError;
pub use explorer::ExplorerResult;
pub use queue::QueueCounts;
pub use store::Store;
