//! DelayedStore port - fire-once 行の保存先
//!
//! 行は fire_at の負値をキーにした index で範囲検索される想定です
//! （`DelayedTask::sort_key` を参照）。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{DelayedId, DelayedTask, QueueName};
use crate::ports::StoreError;

#[async_trait]
pub trait DelayedStore: Send + Sync {
    async fn insert(&self, task: DelayedTask) -> Result<(), StoreError>;

    /// Up to `limit` pending rows with `fire_at <= now`.
    async fn find_due(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DelayedTask>, StoreError>;

    /// Mark a pending row completed. Returns `false` if it was missing or already completed.
    async fn complete(&self, id: DelayedId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn get(&self, id: DelayedId) -> Result<Option<DelayedTask>, StoreError>;
}
