//! Cooperative shutdown.
//!
//! A single `watch` channel carries the stop signal to every long-lived
//! task. Tasks check it at their natural wait points and exit without
//! starting new work; the coordinator then waits for all of them to finish.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Errors that can occur while shutting down.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Some tasks were still running when the grace period ran out
    #[error("shutdown grace period elapsed with tasks still running: {pending:?}")]
    TimedOut { pending: Vec<&'static str> },

    /// A task panicked or was aborted
    #[error("task {name} did not exit cleanly: {reason}")]
    TaskFailed { name: &'static str, reason: String },
}

/// Receiving side of the stop signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    ///
    /// Also resolves when the sending side is gone, since nothing could
    /// ever stop the task after that.
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Owns the stop signal and the join barrier for the relay's tasks.
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            tasks: Vec::new(),
        }
    }

    /// A new receiver for the stop signal.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.tx.subscribe())
    }

    /// Spawn a task that takes part in the join barrier.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name, tokio::spawn(task)));
    }

    /// Send the stop signal without waiting.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Signal every task to stop and wait, at most `grace`, for all of them
    /// to finish. In-flight work is not interrupted.
    pub async fn shutdown(self, grace: Duration) -> Result<(), ShutdownError> {
        info!(tasks = self.tasks.len(), "Shutdown requested");
        self.trigger();

        let deadline = tokio::time::Instant::now() + grace;
        let mut pending = Vec::new();
        let mut failure = None;

        for (name, handle) in self.tasks {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped"),
                Ok(Err(e)) => {
                    error!(task = name, error = %e, "Task did not exit cleanly");
                    failure.get_or_insert(ShutdownError::TaskFailed {
                        name,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!(task = name, "Task still running after grace period");
                    pending.push(name);
                }
            }
        }

        if !pending.is_empty() {
            return Err(ShutdownError::TimedOut { pending });
        }
        match failure {
            Some(e) => Err(e),
            None => {
                info!("Shutdown complete");
                Ok(())
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
