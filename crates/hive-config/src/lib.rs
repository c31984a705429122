pub mod error;
pub mod loader;
pub mod raw;
pub mod settings;

pub use error::ConfigError;
pub use loader::{ensure_dirs, load_settings};
pub use settings::Settings;
