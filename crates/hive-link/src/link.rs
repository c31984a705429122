use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hive_domain::{Drone, DroneConfig};
use serde::{Deserialize, Serialize};

use crate::error::LinkError;

/// Where an SSH-reachable drone lives on the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: Option<String>,
}

impl LinkTarget {
    /// Combine the drone's self-reported address with the admin-owned SSH
    /// settings; sensible defaults when no config row exists.
    pub fn resolve(drone: &Drone, config: Option<&DroneConfig>) -> Self {
        Self {
            host: drone.ip.clone(),
            user: config
                .and_then(|c| c.ssh_user.clone())
                .unwrap_or_else(|| "root".to_string()),
            port: config.and_then(|c| c.ssh_port).unwrap_or(22),
            key_path: config.and_then(|c| c.ssh_key_path.clone()),
        }
    }
}

impl std::fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// What a finished remote command produced.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The outbound SSH/rsync seam. Every call carries an explicit timeout and
/// must never run while a store transaction is open.
#[async_trait]
pub trait DroneLink: Send + Sync + 'static {
    /// Run a shell command on the target.
    async fn exec(
        &self,
        target: &LinkTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, LinkError>;

    /// Copy a local file onto the target.
    async fn copy_file(
        &self,
        target: &LinkTarget,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<(), LinkError>;
}
