use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::LinkError;
use crate::link::{CommandOutput, DroneLink, LinkTarget};

/// Production [`DroneLink`] backed by the `ssh` and `rsync` binaries.
///
/// BatchMode keeps a missing key from degenerating into a password prompt;
/// the connect timeout is enforced by ssh itself, the operation timeout by
/// the caller-supplied bound here.
pub struct SshLink {
    connect_timeout: Duration,
}

impl SshLink {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn ssh_args(&self, target: &LinkTarget) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-p".to_string(),
            target.port.to_string(),
        ];
        if let Some(key) = &target.key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, LinkError> {
        debug!(program, ?args, "spawning");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| LinkError::Timeout(timeout.as_secs()))?
            .map_err(|e| LinkError::io(format!("spawn {}", program), e))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl DroneLink for SshLink {
    async fn exec(
        &self,
        target: &LinkTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, LinkError> {
        let mut args = self.ssh_args(target);
        args.push(format!("{}@{}", target.user, target.host));
        args.push(command.to_string());
        self.run("ssh", &args, timeout).await
    }

    async fn copy_file(
        &self,
        target: &LinkTarget,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let ssh_cmd = {
            let mut parts = vec!["ssh".to_string()];
            parts.extend(self.ssh_args(target));
            parts.join(" ")
        };
        let args = vec![
            "-az".to_string(),
            "-e".to_string(),
            ssh_cmd,
            local.display().to_string(),
            format!("{}@{}:{}", target.user, target.host, remote),
        ];
        let output = self.run("rsync", &args, timeout).await?;
        if !output.success() {
            return Err(LinkError::CopyFailed(format!(
                "rsync exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}
