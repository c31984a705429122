pub mod error;
pub mod link;
pub mod mock;
pub mod probe;
pub mod ssh;

pub use error::LinkError;
pub use link::{CommandOutput, DroneLink, LinkTarget};
pub use mock::ScriptedLink;
pub use probe::probe_target;
pub use ssh::SshLink;
