//! InMemoryTaskStore - 開発用・テスト用の正本
//!
//! # 実装詳細
//! - BTreeMap<TaskId, TaskRecord>: ULID 順 = 作成順に並ぶ
//! - tokio::sync::Mutex 1 本で全操作を直列化（= serializable）
//! - 範囲検索は全件走査 + フィルタ（本番ストアでは secondary index）

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{QueueCounts, QueueName, TaskId, TaskRecord, TaskStatus};
use crate::ports::{StoreError, TaskStore, Write};

#[derive(Default)]
pub struct InMemoryTaskStore {
    rows: Mutex<BTreeMap<TaskId, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows across all queues.
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

fn in_queue<'a>(
    rows: &'a BTreeMap<TaskId, TaskRecord>,
    queue: &'a QueueName,
) -> impl Iterator<Item = &'a TaskRecord> + 'a {
    rows.values().filter(move |r| &r.queue == queue)
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: TaskRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("{} already exists", task.id)));
        }
        rows.insert(task.id, task);
        Ok(())
    }

    async fn insert_unless(
        &self,
        task: TaskRecord,
        conflict: &(dyn for<'r> Fn(&'r TaskRecord) -> bool + Send + Sync),
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let blocked = in_queue(&rows, &task.queue)
            .filter(|r| r.status.is_active())
            .any(conflict);
        if blocked {
            return Ok(false);
        }
        if rows.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("{} already exists", task.id)));
        }
        rows.insert(task.id, task);
        Ok(true)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn modify(
        &self,
        id: TaskId,
        f: &mut (dyn for<'r> FnMut(Option<&'r TaskRecord>) -> Write + Send),
    ) -> Result<Write, StoreError> {
        let mut rows = self.rows.lock().await;
        let write = f(rows.get(&id));
        match &write {
            Write::Unchanged => {}
            Write::Put(record) => {
                if record.id != id {
                    return Err(StoreError::Other(format!(
                        "modify({id}) tried to write {}",
                        record.id
                    )));
                }
                rows.insert(id, record.clone());
            }
            Write::Delete => {
                rows.remove(&id);
            }
        }
        Ok(write)
    }

    async fn find_pending(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(in_queue(&rows, queue)
            .filter(|r| r.status == TaskStatus::Pending && r.start_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_due(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = self.rows.lock().await;
        let mut due: Vec<_> = in_queue(&rows, queue)
            .filter(|r| r.status == TaskStatus::Pending && r.start_at.is_some_and(|at| at <= now))
            .collect();
        due.sort_by_key(|r| (r.start_at, r.id));
        Ok(due.into_iter().take(limit).cloned().collect())
    }

    async fn find_reclaimable(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(in_queue(&rows, queue)
            .filter(|r| r.lease_expired(now) || r.retry_due(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list(
        &self,
        queue: &QueueName,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(in_queue(&rows, queue)
            .filter(|r| status.is_none_or(|s| r.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts(&self, queue: &QueueName) -> Result<QueueCounts, StoreError> {
        let rows = self.rows.lock().await;
        let mut counts = QueueCounts::default();
        for record in in_queue(&rows, queue) {
            counts.add(record.status);
        }
        Ok(counts)
    }
}
