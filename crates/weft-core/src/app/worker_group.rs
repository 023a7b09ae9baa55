use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::LockSeed;

/// Handle to one spawned loop (worker or delayed driver).
/// - `stop()` / drop of the handle's sender ends the loop after its current iteration
/// - `join()` で終了を待てる
pub struct WorkerHandle {
    seed: Option<LockSeed>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn `run` with a fresh shutdown channel.
    pub(crate) fn spawn<F, Fut>(seed: Option<LockSeed>, run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run(shutdown_rx));
        Self {
            seed,
            shutdown_tx,
            join,
        }
    }

    /// The worker's lease token, if this loop leases tasks.
    pub fn seed(&self) -> Option<LockSeed> {
        self.seed
    }

    /// Ask the loop to stop. In-flight handler execution is not cancelled.
    pub fn stop(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "worker task ended abnormally");
        }
    }

    pub async fn shutdown_and_join(self) {
        self.stop();
        self.join().await;
    }
}

/// Worker group handle.
/// - `request_shutdown()` で全ワーカーに停止を要求する
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
#[derive(Default)]
pub struct WorkerGroup {
    workers: Vec<WorkerHandle>,
}

impl WorkerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, worker: WorkerHandle) {
        self.workers.push(worker);
    }

    pub fn extend(&mut self, other: WorkerGroup) {
        self.workers.extend(other.workers);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Request shutdown for all workers.
    /// This does not forcibly cancel in-flight handler execution; it just stops
    /// taking new leases.
    pub fn request_shutdown(&self) {
        for w in &self.workers {
            w.stop();
        }
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for w in self.workers {
            w.join().await;
        }
    }
}

impl From<WorkerHandle> for WorkerGroup {
    fn from(worker: WorkerHandle) -> Self {
        Self {
            workers: vec![worker],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn idle_loop() -> WorkerHandle {
        WorkerHandle::spawn(None, |mut rx| async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    #[tokio::test]
    async fn group_shutdown_stops_every_loop() {
        let mut group = WorkerGroup::new();
        group.push(idle_loop());
        group.extend(WorkerGroup::from(idle_loop()));
        assert_eq!(group.len(), 2);

        tokio::time::timeout(Duration::from_secs(1), group.shutdown_and_join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let handle = idle_loop();
        handle.stop();
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();
    }
}
