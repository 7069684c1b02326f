//! Child process handle shared by the process-backed stages

use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A spawned external process that is killed when stopped or dropped
pub struct ChildProcess {
    name: String,
    child: Option<Child>,
}

impl ChildProcess {
    pub fn spawn(name: &str, command: &mut Command) -> AppResult<Self> {
        debug!(name, command = ?command.as_std(), "Spawning");
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::process(name, format!("failed to spawn: {}", e)))?;
        info!(name, pid = ?child.id(), "Started");
        Ok(Self {
            name: name.to_string(),
            child: Some(child),
        })
    }

    /// `Some(status)` once the process has exited on its own
    pub fn exited(&mut self) -> Option<String> {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(e) => Some(e.to_string()),
            },
            None => Some("not running".to_string()),
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.exited().is_none()
    }

    /// Kill the process and wait briefly for it to exit
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            child.kill().await.ok();
            let _ = tokio::time::timeout(STOP_TIMEOUT, child.wait()).await;
            info!(name = %self.name, "Stopped");
        }
    }
}

/// Run a command to completion, failing on a non-zero exit
pub async fn run_and_wait(name: &str, command: &mut Command) -> AppResult<String> {
    let output = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| AppError::process(name, format!("failed to execute: {}", e)))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(AppError::process(
            name,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}
