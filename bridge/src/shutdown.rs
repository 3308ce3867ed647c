use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::ChatClient;

/// How long workers get to finish their current iteration before the
/// process is terminated anyway.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Cooperative shutdown for the per-connection sync workers. Each worker
/// polls a clone of the cancellation token between sync iterations;
/// in-flight network calls are left to finish or fail on their own, which
/// is why the grace period is backed by a hard exit.
pub struct ShutdownCoordinator {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// A token for a worker to poll. Cancelled once shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn register(&mut self, handle: JoinHandle<()>) {
        self.workers.push(handle);
    }

    /// Stop every worker and wait up to [`SHUTDOWN_GRACE`] for them to
    /// drain. Exits the process outright if they don't make it in time.
    pub async fn shutdown<C: ChatClient>(self, connections: &[Arc<C>]) {
        info!("shutting down");
        self.cancel.cancel();
        for connection in connections {
            connection.stop();
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(self.workers))
            .await
            .is_err()
        {
            warn!("sync workers did not stop within the grace period, forcing exit");
            std::process::exit(0);
        }
        info!("all sync workers stopped");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
