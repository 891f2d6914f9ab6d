//! Graceful shutdown handling
//!
//! Signal handling plus a cancellation token that scopes the credential
//! watcher and every aggregate watch.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator for graceful termination
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator with default 30s timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
        }
    }

    /// Token cancelled when shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Child token for a scope that may also be cancelled on its own
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Initiating graceful shutdown");
            self.token.cancel();
        }
    }

    /// Wait for a termination signal, then start shutdown
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigquit = signal(SignalKind::quit())?;

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = sigquit.recv() => info!("Received SIGQUIT"),
                _ = self.token.cancelled() => return Ok(()),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C");
                }
                _ = self.token.cancelled() => return Ok(()),
            }
        }

        self.shutdown();
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Background tasks joined at shutdown
#[derive(Debug, Default)]
pub struct TaskShutdown {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a background task for shutdown
    pub fn register(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task to exit, aborting any that outlive `timeout`.
    ///
    /// Tasks are expected to watch a cancelled token already.
    pub async fn join_all(&mut self, timeout: Duration) {
        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped"),
                Ok(Err(e)) if e.is_cancelled() => info!(task = name, "Task cancelled"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task failed"),
                Err(_) => {
                    warn!(task = name, "Task did not stop within timeout, aborting");
                    handle.abort();
                }
            }
        }
    }
}
