//! One cancellation source for the whole process.
//!
//! Ctrl-C, SIGTERM and heartbeat failures all cancel the same token. Work
//! tied to the token gets `grace` to finish once it fires, then is aborted.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::messaging::HealthChecker;

/// Trigger reason used when the broker heartbeat fails.
pub const HEARTBEAT_FAILED: &str = "broker heartbeat failed";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DrainError {
    #[error("{task} failed: {reason}")]
    Failed { task: String, reason: String },
    #[error("{task} still running after {}s grace period; aborted", .grace.as_secs())]
    GraceExpired { task: String, grace: Duration },
}

#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    grace: Duration,
    reason: Arc<parking_lot::Mutex<Option<String>>>,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace,
            reason: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why shutdown was first triggered, if it has been.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Only the first trigger is recorded.
    pub fn trigger(&self, reason: &str) {
        {
            let mut first = self.reason.lock();
            if first.is_some() {
                return;
            }
            *first = Some(reason.to_string());
        }
        info!(reason, "shutdown requested");
        self.token.cancel();
    }

    /// Triggers on Ctrl-C or, on unix, SIGTERM.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = coordinator.token.cancelled() => {}
                _ = ctrl_c() => coordinator.trigger("ctrl-c"),
                _ = terminate() => coordinator.trigger("SIGTERM"),
            }
        })
    }

    /// Triggers when the health checker reports its first failure.
    pub fn watch_health(&self, health: Arc<HealthChecker>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = coordinator.token.cancelled() => {}
                failure = health.failure() => {
                    if failure.is_some() {
                        coordinator.trigger(HEARTBEAT_FAILED);
                    }
                }
            }
        })
    }

    /// Returns the task's output if it finishes on its own. Once shutdown has
    /// been triggered the task gets `grace` to finish before it is aborted.
    pub async fn drain<T>(&self, task: &str, mut handle: JoinHandle<T>) -> Result<T, DrainError> {
        let joined = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = self.token.cancelled() => None,
        };

        let joined = match joined {
            Some(joined) => joined,
            None => match tokio::time::timeout(self.grace, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    warn!(task, grace_secs = self.grace.as_secs(), "grace period expired");
                    return Err(DrainError::GraceExpired {
                        task: task.to_string(),
                        grace: self.grace,
                    });
                }
            },
        };

        joined.map_err(|err| {
            error!(task, error = %err, "task ended abnormally");
            DrainError::Failed {
                task: task.to_string(),
                reason: err.to_string(),
            }
        })
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "unable to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            warn!(error = %err, "unable to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
