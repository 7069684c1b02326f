//! Ordered stages and the supervisor driving them
//!
//! Stages start front to back and stop back to front. If any stage fails to
//! start, every stage that already started is stopped before the error is
//! returned, so a failed session leaks no child process or port-forward.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait Stage: Send {
    fn name(&self) -> &str;

    async fn start(&mut self) -> AppResult<()>;

    async fn stop(&mut self) -> AppResult<()>;

    /// Reason the stage died after a successful start, if it did
    fn failure(&mut self) -> Option<String> {
        None
    }
}

pub struct Supervisor {
    stages: Vec<Box<dyn Stage>>,
    started: usize,
    token: CancellationToken,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            stages: Vec::new(),
            started: 0,
            token,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Names of the stages currently running, in start order
    pub fn running(&self) -> Vec<&str> {
        self.stages[..self.started].iter().map(|s| s.name()).collect()
    }

    /// Start every stage in order. On failure or cancellation, stop the ones
    /// already started and return the error.
    pub async fn start(&mut self) -> AppResult<()> {
        while self.started < self.stages.len() {
            if self.token.is_cancelled() {
                self.shutdown().await;
                return Err(AppError::process("supervisor", "cancelled during startup"));
            }
            let stage = &mut self.stages[self.started];
            info!(stage = stage.name(), "Starting");
            if let Err(e) = stage.start().await {
                error!(stage = stage.name(), error = %e, "Failed to start");
                self.shutdown().await;
                return Err(e);
            }
            self.started += 1;
        }
        Ok(())
    }

    /// Wait until the token is cancelled or a running stage dies, then stop
    /// everything in reverse order. A dead stage is reported as an error.
    pub async fn run(&mut self) -> AppResult<()> {
        let token = self.token.clone();
        let mut ticker = tokio::time::interval(self.poll_interval);
        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    if let Some(err) = self.dead_stage() {
                        break Err(err);
                    }
                }
            }
        };
        // Let every other holder of the root token know the session is over
        token.cancel();
        self.shutdown().await;
        outcome
    }

    fn dead_stage(&mut self) -> Option<AppError> {
        self.stages[..self.started].iter_mut().find_map(|stage| {
            stage.failure().map(|reason| {
                error!(stage = stage.name(), reason = %reason, "Stage exited");
                AppError::process(stage.name(), reason)
            })
        })
    }

    /// Stop started stages, last started first. Stop errors are logged.
    pub async fn shutdown(&mut self) {
        while self.started > 0 {
            self.started -= 1;
            let stage = &mut self.stages[self.started];
            info!(stage = stage.name(), "Stopping");
            if let Err(e) = stage.stop().await {
                warn!(stage = stage.name(), error = %e, "Failed to stop cleanly");
            }
        }
    }
}
