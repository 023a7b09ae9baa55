//! TaskStore port - トランザクショナルな KV ストアが実装する正本（source of truth）
//!
//! # 設計原則
//! - 状態遷移は `modify` の 1 回の atomic な read-modify-write で行う
//! - closure は同期（I/O なし）。ストアは衝突時に closure を再実行してよい
//! - Lease の権威はここにある（pub/sub の wake-up は候補通知に過ぎない）
//! - 範囲検索は queue ごとの順序付き secondary index を前提にする
//!
//! 本番用の実装（FoundationDB, PostgreSQL など）は別クレートに置き、
//! このクレートには `impls::InMemoryTaskStore` だけを含めます。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{QueueCounts, QueueName, TaskId, TaskRecord, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

/// Result of a read-modify-write closure.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Leave the row as it is (or absent).
    Unchanged,

    /// Replace (or create) the row.
    Put(TaskRecord),

    /// Remove the row.
    Delete,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: TaskRecord) -> Result<(), StoreError>;

    /// Insert `task` unless an active row of the same queue matches `conflict`.
    ///
    /// Check and insert happen in one transaction. Returns whether the row was inserted.
    async fn insert_unless(
        &self,
        task: TaskRecord,
        conflict: &(dyn for<'r> Fn(&'r TaskRecord) -> bool + Send + Sync),
    ) -> Result<bool, StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Atomic read-modify-write of one row. Returns the write that was committed.
    async fn modify(
        &self,
        id: TaskId,
        f: &mut (dyn for<'r> FnMut(Option<&'r TaskRecord>) -> Write + Send),
    ) -> Result<Write, StoreError>;

    /// Pending rows with no `start_at`, oldest first.
    async fn find_pending(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Pending rows whose `start_at <= now`, earliest first.
    async fn find_due(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Executing rows with an expired lease and failing rows whose backoff elapsed.
    async fn find_reclaimable(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Rows of a queue, optionally filtered by status, oldest first.
    async fn list(
        &self,
        queue: &QueueName,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn counts(&self, queue: &QueueName) -> Result<QueueCounts, StoreError>;
}
