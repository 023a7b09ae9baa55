//! DelayedQueue - 指定時刻に 1 回だけ実行する行（single driver）
//!
//! # 設計原則
//! - lease を持たない。クラスタロックを取れたプロセスだけが tick を処理する
//! - retry / backoff は無い。handler が失敗したらその tick はそこで止まり、
//!   行は Pending のまま次の tick で再実行される
//! - 完了した行は削除せず `Completed` として残す
//!
//! # フロー（tick ごと）
//! 1. ClusterLock::try_acquire()（取れなければ skip）
//! 2. find_due() で `fire_at <= now` の行を batch_size 件まで取得
//! 3. 1 件ずつ handler を呼び、成功したら complete()
//!
//! 失敗した行はインデックス上の同じ位置に残るので、成功するまでその後ろの行も処理されない。
//! error ログには行 id と未処理の件数を出す。

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::backend::Backend;
use super::config::DelayedConfig;
use super::worker_group::WorkerHandle;
use crate::domain::{DelayedId, DelayedTask, QueueName, Result};
use crate::typed::payload::{decode, encode};
use crate::typed::{DelayedHandler, Payload};

pub struct DelayedQueue<T> {
    name: QueueName,
    backend: Backend,
    config: Arc<DelayedConfig>,
    holder: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for DelayedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            config: Arc::clone(&self.config),
            holder: self.holder.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for DelayedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedQueue")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl<T: Payload> DelayedQueue<T> {
    pub fn new(name: impl Into<QueueName>, backend: Backend, config: DelayedConfig) -> Result<Self> {
        config.validate()?;
        let holder = backend.ids.generate_lock_seed().to_string();
        Ok(Self {
            name: name.into(),
            backend,
            config: Arc::new(config),
            holder,
            _payload: PhantomData,
        })
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    /// Cluster lock guarding this queue's driver.
    pub fn lock_name(&self) -> String {
        format!("weft.delayed.{}", self.name)
    }

    pub async fn enqueue(&self, payload: &T, fire_at: DateTime<Utc>) -> Result<DelayedTask> {
        let task = DelayedTask::new(
            self.name.clone(),
            self.backend.ids.generate_delayed_id(),
            encode(payload)?,
            fire_at,
            self.backend.clock.now(),
        );
        self.backend.delayed.insert(task.clone()).await?;
        info!(queue = %self.name, delayed_id = %task.id, %fire_at, "delayed task enqueued");
        Ok(task)
    }

    pub async fn get(&self, id: DelayedId) -> Result<Option<DelayedTask>> {
        Ok(self.backend.delayed.get(id).await?)
    }

    /// One driver tick. `None` when another process holds the lock, else rows completed.
    pub async fn tick<H: DelayedHandler<T>>(&self, handler: &H) -> Result<Option<usize>> {
        let acquired = self
            .backend
            .lock
            .try_acquire(
                &self.lock_name(),
                &self.holder,
                self.config.lock_version,
                self.config.lock_ttl,
            )
            .await?;
        if !acquired {
            debug!(queue = %self.name, "not the delayed driver, tick skipped");
            return Ok(None);
        }

        let now = self.backend.clock.now();
        let due = self
            .backend
            .delayed
            .find_due(&self.name, now, self.config.batch_size)
            .await?;

        let total = due.len();
        let mut completed = 0;
        for (i, task) in due.into_iter().enumerate() {
            let outcome = match decode::<T>(&task.payload) {
                Ok(payload) => handler.handle(payload, &task).await.map_err(|e| format!("{e:#}")),
                Err(e) => Err(format!("payload decode failed: {e}")),
            };
            if let Err(message) = outcome {
                error!(
                    queue = %self.name,
                    delayed_id = %task.id,
                    fire_at = %task.fire_at,
                    unprocessed = total - i,
                    error = %message,
                    "delayed task failed, queue blocked until it succeeds"
                );
                break;
            }
            if self.backend.delayed.complete(task.id, self.backend.clock.now()).await? {
                completed += 1;
            }
        }

        if completed > 0 {
            info!(queue = %self.name, completed, "delayed tasks fired");
        }
        Ok(Some(completed))
    }

    /// Spawn the driver loop. The cluster lock is released when it stops.
    pub fn start<H: DelayedHandler<T>>(&self, handler: Arc<H>) -> WorkerHandle {
        let queue = self.clone();
        WorkerHandle::spawn(None, move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(queue.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(queue = %queue.name, holder = %queue.holder, "delayed driver started");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                let stopped = tokio::select! {
                    changed = shutdown.changed() => Some(changed.is_err()),
                    _ = ticker.tick() => None,
                };
                match stopped {
                    Some(true) => break,
                    Some(false) => continue,
                    None => {}
                }
                if let Err(e) = queue.tick(handler.as_ref()).await {
                    warn!(queue = %queue.name, error = %e, "delayed tick failed");
                }
            }

            if let Err(e) = queue.backend.lock.release(&queue.lock_name(), &queue.holder).await {
                warn!(queue = %queue.name, error = %e, "failed to release delayed driver lock");
            }
            info!(queue = %queue.name, "delayed driver stopped");
        })
    }
}
