//! Detached background work with its own error channel.
//!
//! Side effects that must not hold up a mutation (remote activity-log
//! writes) run here. Their failures are logged and published on an
//! unbounded channel instead of reaching the mutation's caller.

use std::future::Future;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundError {
    pub task: &'static str,
    pub message: String,
}

pub struct BackgroundTasks {
    tracker: TaskTracker,
    errors_tx: mpsc::UnboundedSender<BackgroundError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<BackgroundError>>>,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            tracker: TaskTracker::new(),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }

    /// Spawn `work` on the current runtime. Must be called from within a
    /// tokio context.
    pub fn spawn<F>(&self, task: &'static str, work: F)
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        let errors_tx = self.errors_tx.clone();
        self.tracker.spawn(async move {
            if let Err(message) = work.await {
                warn!(task, error = %message, "Background task failed");
                let _ = errors_tx.send(BackgroundError { task, message });
            }
        });
    }

    /// Hand out the error receiver. Only the first caller gets it.
    pub fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<BackgroundError>> {
        self.errors_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every task spawned so far.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
