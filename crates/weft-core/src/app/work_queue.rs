//! WorkQueue - 型付きの work queue（producer と worker の入り口）
//!
//! # 設計原則
//! - enqueue は 1 行の insert だけ。ULID なので並行 enqueue が衝突しない
//! - wake-up は commit の後に best-effort で publish（失敗してもエラーにしない）
//! - worker は独立した loop として spawn する（`add_worker` / `add_workers`）
//!
//! # 学習ポイント
//! - `PhantomData<fn() -> T>` で payload 型だけを持つ（T: !Sync でも Queue は Sync）
//! - Clone は手書き（derive だと `T: Clone` が要求されてしまう）

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::backend::Backend;
use super::config::QueueConfig;
use super::worker_group::{WorkerGroup, WorkerHandle};
use super::worker_loop::Worker;
use crate::domain::{QueueCounts, QueueName, Result, TaskId, TaskRecord, TaskStatus, WeftError};
use crate::ports::Write;
use crate::typed::payload::encode;
use crate::typed::{Handler, Payload};

pub struct WorkQueue<T> {
    name: QueueName,
    backend: Backend,
    config: Arc<QueueConfig>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            config: Arc::clone(&self.config),
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<T: Payload> WorkQueue<T> {
    pub fn new(name: impl Into<QueueName>, backend: Backend, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            backend,
            config: Arc::new(config),
            _payload: PhantomData,
        })
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Enqueue for immediate execution.
    pub async fn enqueue(&self, payload: &T) -> Result<TaskRecord> {
        self.push(payload, None).await
    }

    /// Enqueue to run no earlier than `start_at`.
    pub async fn enqueue_at(&self, payload: &T, start_at: DateTime<Utc>) -> Result<TaskRecord> {
        self.push(payload, Some(start_at)).await
    }

    pub(crate) async fn push(&self, payload: &T, start_at: Option<DateTime<Utc>>) -> Result<TaskRecord> {
        let task = self.record(payload, start_at)?;
        self.backend.store.insert(task.clone()).await?;
        self.announce(&task).await;
        Ok(task)
    }

    /// Insert unless an active row of this queue matches `conflict`. `None` when skipped.
    pub(crate) async fn push_unless(
        &self,
        payload: &T,
        start_at: Option<DateTime<Utc>>,
        conflict: &(dyn for<'r> Fn(&'r TaskRecord) -> bool + Send + Sync),
    ) -> Result<Option<TaskRecord>> {
        let task = self.record(payload, start_at)?;
        if !self.backend.store.insert_unless(task.clone(), conflict).await? {
            debug!(queue = %self.name, "conflicting task already active, enqueue skipped");
            return Ok(None);
        }
        self.announce(&task).await;
        Ok(Some(task))
    }

    fn record(&self, payload: &T, start_at: Option<DateTime<Utc>>) -> Result<TaskRecord> {
        Ok(TaskRecord::new(
            self.name.clone(),
            self.backend.ids.generate_task_id(),
            encode(payload)?,
            self.config.max_failures,
            start_at,
            self.backend.clock.now(),
        ))
    }

    async fn announce(&self, task: &TaskRecord) {
        info!(queue = %self.name, task_id = %task.id, start_at = ?task.start_at, "task enqueued");
        // future tasks are found by polling
        if task.start_at.is_none() {
            self.backend.wake(&self.name.topic()).await;
        }
    }

    /// A worker bound to this queue, not yet running.
    pub fn worker<H: Handler<T>>(&self, handler: Arc<H>) -> Worker<T, H> {
        Worker::new(self.name.clone(), self.backend.clone(), Arc::clone(&self.config), handler)
    }

    /// Spawn one worker loop with its own lease token.
    pub fn add_worker<H: Handler<T>>(&self, handler: Arc<H>) -> WorkerHandle {
        let worker = self.worker(handler);
        WorkerHandle::spawn(Some(worker.seed()), |shutdown| worker.run(shutdown))
    }

    /// Spawn `concurrency` independent worker loops sharing `handler`.
    pub fn add_workers<H: Handler<T>>(&self, handler: Arc<H>, concurrency: usize) -> WorkerGroup {
        let mut group = WorkerGroup::new();
        for _ in 0..concurrency {
            group.push(self.add_worker(Arc::clone(&handler)));
        }
        group
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.backend.store.get(id).await?)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        Ok(self.backend.store.counts(&self.name).await?)
    }

    /// Dead-lettered tasks, oldest first.
    pub async fn failed(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        Ok(self
            .backend
            .store
            .list(&self.name, Some(TaskStatus::Failed), limit)
            .await?)
    }

    /// Move a dead-lettered task back to `Pending` with a fresh retry budget.
    pub async fn retry_failed(&self, id: TaskId) -> Result<TaskRecord> {
        let mut found: Option<TaskStatus> = None;
        let write = self
            .backend
            .store
            .modify(id, &mut |row| {
                found = row.map(|r| r.status);
                match row {
                    Some(r) if r.status == TaskStatus::Failed => {
                        let mut r = r.clone();
                        r.revive();
                        Write::Put(r)
                    }
                    _ => Write::Unchanged,
                }
            })
            .await?;

        match (write, found) {
            (Write::Put(task), _) => {
                info!(queue = %self.name, task_id = %id, "dead letter requeued");
                self.backend.wake(&self.name.topic()).await;
                Ok(task)
            }
            (_, None) => Err(WeftError::NotFound(id)),
            (_, Some(actual)) => Err(WeftError::InvalidState {
                id,
                expected: TaskStatus::Failed,
                actual,
            }),
        }
    }
}
