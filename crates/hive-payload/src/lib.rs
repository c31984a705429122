pub mod deploy;
pub mod error;
pub mod registry;
pub mod release;

pub use deploy::{DeployResult, Deployer, RollingOutcome, VerifyOutcome};
pub use error::PayloadError;
pub use registry::{sha256_hex, PayloadRegistry};
pub use release::{ReleaseDiff, ReleaseManager};
