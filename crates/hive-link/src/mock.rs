use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LinkError;
use crate::link::{CommandOutput, DroneLink, LinkTarget};

/// Default a [`ScriptedLink`] falls back to when its queue is empty.
enum Fallback {
    Healthy,
    Unreachable,
}

/// Programmable [`DroneLink`] for tests: queued responses play back FIFO,
/// then every further call takes the fallback. Records all traffic.
pub struct ScriptedLink {
    fallback: Fallback,
    execs: Mutex<VecDeque<Result<CommandOutput, LinkError>>>,
    copies: Mutex<VecDeque<Result<(), LinkError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedLink {
    /// Every unscripted exec succeeds with a healthy probe shape.
    pub fn healthy() -> Self {
        Self {
            fallback: Fallback::Healthy,
            execs: Mutex::new(VecDeque::new()),
            copies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every unscripted exec times out.
    pub fn unreachable() -> Self {
        Self {
            fallback: Fallback::Unreachable,
            ..Self::healthy()
        }
    }

    pub fn push_exec(&self, result: Result<CommandOutput, LinkError>) {
        self.execs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    pub fn push_copy(&self, result: Result<(), LinkError>) {
        self.copies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    /// Everything executed or copied so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn healthy_output() -> CommandOutput {
        CommandOutput {
            exit_code: 0,
            stdout: "0.10 0.12 0.09 1/100 999\n/dev/sda1 100 40 60 40% /\nworker=up\n"
                .to_string(),
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl DroneLink for ScriptedLink {
    async fn exec(
        &self,
        target: &LinkTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, LinkError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("exec {} {}", target, command));
        if let Some(result) = self
            .execs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return result;
        }
        match self.fallback {
            Fallback::Healthy => Ok(Self::healthy_output()),
            Fallback::Unreachable => Err(LinkError::Timeout(timeout.as_secs())),
        }
    }

    async fn copy_file(
        &self,
        target: &LinkTarget,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("copy {} {} -> {}", target, local.display(), remote));
        if let Some(result) = self
            .copies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return result;
        }
        match self.fallback {
            Fallback::Healthy => Ok(()),
            Fallback::Unreachable => Err(LinkError::Timeout(timeout.as_secs())),
        }
    }
}
