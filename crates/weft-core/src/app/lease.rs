//! LeaseRenewal - handler 実行中の lease 延長
//!
//! handler とは別の tokio task で `renew_interval` ごとに
//! `lock_timeout = now + lease_timeout` を書き込みます。
//! handler が返ったら `stop()` で止めて join します。
//!
//! 所有権（status + lock_seed）が失われていたら延長をやめます。
//! その後の finalize も所有権チェックで no-op になります。

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::backend::Backend;
use super::worker_loop::chrono_duration;
use crate::domain::{LockSeed, TaskId};
use crate::ports::Write;

pub(crate) struct LeaseRenewal {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl LeaseRenewal {
    pub(crate) fn start(
        backend: Backend,
        task_id: TaskId,
        seed: LockSeed,
        lease_timeout: Duration,
        renew_interval: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + renew_interval, renew_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match renew(&backend, task_id, seed, lease_timeout).await {
                            Ok(true) => debug!(task_id = %task_id, "lease renewed"),
                            Ok(false) => {
                                warn!(task_id = %task_id, seed = %seed, "lease lost, renewal stopped");
                                break;
                            }
                            Err(e) => warn!(task_id = %task_id, error = %e, "lease renewal failed"),
                        }
                    }
                }
            }
        });
        Self { stop_tx, join }
    }

    /// Stop renewing and wait for the renewal task to exit.
    pub(crate) async fn stop(self) {
        // the task may already have exited after losing the lease
        let _ = self.stop_tx.send(());
        let _ = self.join.await;
    }
}

async fn renew(
    backend: &Backend,
    task_id: TaskId,
    seed: LockSeed,
    lease_timeout: Duration,
) -> crate::domain::Result<bool> {
    let until = backend.clock.now() + chrono_duration(lease_timeout);
    let write = backend
        .store
        .modify(task_id, &mut |row| match row {
            Some(r) if r.is_owned_by(seed) => {
                let mut r = r.clone();
                r.renew(until);
                Write::Put(r)
            }
            _ => Write::Unchanged,
        })
        .await?;
    Ok(matches!(write, Write::Put(_)))
}
