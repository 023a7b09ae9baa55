//! InMemoryDelayedStore - 開発用の fire-once ストア
//!
//! pending 行だけを (queue, -fire_at_ms, id) の BTreeSet に載せておき、
//! `(queue, -now_ms)` からの前方範囲検索で期限切れの行だけを取り出します。

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::domain::delayed::fire_key;
use crate::domain::{DelayedId, DelayedStatus, DelayedTask, QueueName};
use crate::ports::{DelayedStore, StoreError};

#[derive(Default)]
struct State {
    rows: HashMap<DelayedId, DelayedTask>,
    pending: BTreeSet<(QueueName, i64, DelayedId)>,
}

#[derive(Default)]
pub struct InMemoryDelayedStore {
    state: Mutex<State>,
}

impl InMemoryDelayedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DelayedStore for InMemoryDelayedStore {
    async fn insert(&self, task: DelayedTask) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.rows.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("{} already exists", task.id)));
        }
        if task.status == DelayedStatus::Pending {
            state
                .pending
                .insert((task.queue.clone(), task.sort_key(), task.id));
        }
        state.rows.insert(task.id, task);
        Ok(())
    }

    async fn find_due(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DelayedTask>, StoreError> {
        let state = self.state.lock().await;
        let from = (queue.clone(), fire_key(now), DelayedId::from_ulid(Ulid::nil()));
        let to = (queue.clone(), i64::MAX, DelayedId::from_ulid(Ulid(u128::MAX)));
        Ok(state
            .pending
            .range(from..=to)
            .filter_map(|(_, _, id)| state.rows.get(id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn complete(&self, id: DelayedId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.rows.get_mut(&id) else {
            return Ok(false);
        };
        if row.status != DelayedStatus::Pending {
            return Ok(false);
        }
        row.complete(now);
        let key = (row.queue.clone(), row.sort_key(), id);
        state.pending.remove(&key);
        Ok(true)
    }

    async fn get(&self, id: DelayedId) -> Result<Option<DelayedTask>, StoreError> {
        Ok(self.state.lock().await.rows.get(&id).cloned())
    }
}
