pub mod error;
pub mod monitor;
pub mod selfheal;

pub use error::HealthError;
pub use monitor::HealthMonitor;
pub use selfheal::SelfHealer;
