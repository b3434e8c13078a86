//! Background snapshot loop for an [`IdentityStore`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::store::IdentityStore;

/// Interval between snapshots when none is configured.
pub const DEFAULT_DUMP_INTERVAL: Duration = Duration::from_secs(300);

/// Periodically dumps a store to a snapshot file.
pub struct PersistenceLoop;

impl PersistenceLoop {
    /// Spawns the loop on the current tokio runtime.
    ///
    /// The first snapshot is taken immediately, then one every `interval`.
    /// A failed snapshot is logged and retried on the next tick; it never
    /// ends the loop. Dumps run on the blocking pool.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(
        store: Arc<IdentityStore>,
        path: PathBuf,
        interval: Duration,
    ) -> PersistenceHandle {
        let cancel = CancellationToken::new();
        let completed = Arc::new(AtomicU64::new(0));

        let task_cancel = cancel.clone();
        let task_completed = Arc::clone(&completed);
        let task = tokio::spawn(async move {
            info!(
                path = %path.display(),
                interval_secs = interval.as_secs_f64(),
                "persistence loop started"
            );
            loop {
                if task_cancel.is_cancelled() {
                    break;
                }

                let dump_store = Arc::clone(&store);
                let dump_path = path.clone();
                match tokio::task::spawn_blocking(move || dump_store.dump_to(&dump_path)).await {
                    Ok(Ok(_)) => {
                        task_completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(Err(e)) => error!(path = %path.display(), error = %e, "snapshot failed"),
                    Err(e) => error!(path = %path.display(), error = %e, "snapshot task panicked"),
                }

                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!(path = %path.display(), "persistence loop stopped");
        });

        PersistenceHandle {
            cancel,
            completed,
            task,
        }
    }
}

/// Handle to a running [`PersistenceLoop`]. Dropping it leaves the loop
/// running; call [`stop`](Self::stop) or [`shutdown`](Self::shutdown).
pub struct PersistenceHandle {
    cancel: CancellationToken,
    completed: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl PersistenceHandle {
    /// Signals the loop to exit. An in-flight snapshot is allowed to finish.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of snapshots written successfully so far.
    pub fn completed_dumps(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Waits for the loop task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "persistence loop task failed");
        }
    }

    /// Stops the loop and waits for it.
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}
